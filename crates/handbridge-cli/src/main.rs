//! `handbridge` – tracked-hand → robotic-hand control bridge.
//!
//! Boots the whole stack: configuration (file + env + flags), structured
//! logging with optional OTLP export, the bridge actor with its timing
//! domains, and the WebSocket session hub.  Ctrl-C disarms the hand and
//! shuts everything down; nothing else is allowed to end the process.

mod telemetry;

use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use tokio::sync::mpsc;
use tracing::{error, info};

use handbridge_bridge::{Bridge, BridgeCommand, BridgeConfig, SessionHub};
use handbridge_control::MappingConfig;
use handbridge_hal::{DriverFactory, HandDriver, SimHand};
use handbridge_types::BridgeError;

/// Actionable hint for the most common connect failure: the OS bound the
/// hand to a serial driver instead of a generic USB one.
const DRIVER_HINT: &str =
    "hand transport driver unavailable; if the device is attached, rebind it \
     from the serial (usbser) driver to WinUSB/libusb and reconnect";

#[derive(Parser, Debug)]
#[command(name = "handbridge", version, about = "Teleoperation bridge for a multi-jointed robotic hand")]
struct Cli {
    /// TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket listen host.
    #[arg(long)]
    host: Option<String>,
    /// WebSocket listen port.
    #[arg(long)]
    port: Option<u16>,

    /// USB vendor id, e.g. 0x0483.
    #[arg(long, value_parser = parse_u16_maybe_hex)]
    usb_vid: Option<u16>,
    /// USB product id; omit to match any.
    #[arg(long, value_parser = parse_u16_maybe_hex)]
    usb_pid: Option<u16>,
    /// USB serial number, when several hands are attached.
    #[arg(long)]
    serial: Option<String>,

    /// Control tick rate (Hz).
    #[arg(long)]
    control_hz: Option<f64>,
    /// Telemetry poll/broadcast rate (Hz).
    #[arg(long)]
    telemetry_hz: Option<f64>,
    /// Seconds without a tracking frame before the hand is released.
    #[arg(long)]
    watchdog_s: Option<f64>,

    /// Max joint target speed while tracking (rad/s); 0 disables limiting.
    #[arg(long)]
    max_speed: Option<f64>,
    /// Max joint target speed during reset/unjam (rad/s).
    #[arg(long)]
    unjam_max_speed: Option<f64>,
    /// Max curl (0 = open, 1 = full fist).
    #[arg(long)]
    max_curl: Option<f64>,
    /// Open-pose safety margin (0..0.5) toward closed, off the hard stops.
    #[arg(long)]
    open_margin: Option<f64>,

    /// Joint current limit in normal operation (mA).
    #[arg(long)]
    normal_current_ma: Option<u32>,
    /// Reduced joint current limit during reset/unjam (mA).
    #[arg(long)]
    unjam_current_ma: Option<u32>,
    /// Disable automatic recovery on joint errors.
    #[arg(long)]
    no_auto_unjam: bool,

    /// Deadline for the open-on-arm reset (s).
    #[arg(long)]
    arm_reset_s: Option<f64>,
    /// Deadline for manual/auto recovery (s).
    #[arg(long)]
    reset_open_s: Option<f64>,
    /// Reset completion threshold vs the open pose (rad).
    #[arg(long)]
    reset_threshold: Option<f64>,

    /// Drop to disarmed when the last observer disconnects.
    #[arg(long)]
    disarm_on_last_disconnect: bool,

    /// Mapping file (finger weights + open/closed pose modes).
    #[arg(long)]
    mapping: Option<PathBuf>,
    /// Run against the in-process simulator instead of real hardware.
    #[arg(long)]
    dry_run: bool,
}

fn parse_u16_maybe_hex(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

impl Cli {
    /// Fold the flags over a loaded config; flags always win.
    fn apply_to(&self, cfg: &mut BridgeConfig) {
        if let Some(v) = &self.host {
            cfg.host = v.clone();
        }
        if let Some(v) = self.port {
            cfg.port = v;
        }
        if let Some(v) = self.usb_vid {
            cfg.usb_vid = v;
        }
        if let Some(v) = self.usb_pid {
            cfg.usb_pid = Some(v);
        }
        if let Some(v) = &self.serial {
            cfg.serial = Some(v.clone());
        }
        if let Some(v) = self.control_hz {
            cfg.control_hz = v;
        }
        if let Some(v) = self.telemetry_hz {
            cfg.telemetry_hz = v;
        }
        if let Some(v) = self.watchdog_s {
            cfg.watchdog_s = v;
        }
        if let Some(v) = self.max_speed {
            cfg.max_speed_rad_s = v;
        }
        if let Some(v) = self.unjam_max_speed {
            cfg.unjam_max_speed_rad_s = v;
        }
        if let Some(v) = self.normal_current_ma {
            cfg.normal_current_ma = v;
        }
        if let Some(v) = self.unjam_current_ma {
            cfg.unjam_current_ma = v;
        }
        if self.no_auto_unjam {
            cfg.auto_unjam_on_error = false;
        }
        if let Some(v) = self.arm_reset_s {
            cfg.arm_reset_s = v;
        }
        if let Some(v) = self.reset_open_s {
            cfg.reset_open_s = v;
        }
        if let Some(v) = self.reset_threshold {
            cfg.reset_threshold_rad = v;
        }
        if self.disarm_on_last_disconnect {
            cfg.disarm_on_last_disconnect = true;
        }
        if let Some(v) = &self.mapping {
            cfg.mapping_path = Some(v.clone());
        }
        if self.dry_run {
            cfg.dry_run = true;
        }
        cfg.sanitize();
    }

    /// Mapping overrides land after the mapping file is loaded.
    fn apply_to_mapping(&self, mapping: &mut MappingConfig) {
        if let Some(v) = self.max_curl {
            mapping.max_curl = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.open_margin
            && (0.0..=0.5).contains(&v)
        {
            mapping.open_margin = v;
        }
    }
}

/// Pick the transport: the simulator in dry-run, otherwise the vendor
/// driver seam.  Without a vendor transport linked in, every attempt
/// fails with an actionable message and the connector keeps backing off,
/// which is exactly the behavior for an absent device.
fn driver_factory(dry_run: bool) -> DriverFactory {
    if dry_run {
        let sim = SimHand::new();
        Box::new(move |_| Ok(Box::new(sim.clone()) as Box<dyn HandDriver>))
    } else {
        Box::new(|selector| {
            Err(BridgeError::DriverIncompatible(format!(
                "{DRIVER_HINT} (vid={:#06x})",
                selector.usb_vid
            )))
        })
    }
}

fn print_banner(cfg: &BridgeConfig) {
    println!();
    println!("  {} {}", "handbridge".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Tracked-hand teleoperation bridge");
    println!();
    println!("  listen    ws://{}", cfg.listen_addr().bold());
    println!(
        "  hardware  {}",
        if cfg.dry_run {
            "simulator (dry run)".yellow().to_string()
        } else {
            format!("usb {:#06x}", cfg.usb_vid)
        }
    );
    println!();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing("handbridge");

    let mut cfg = BridgeConfig::load_or_default(cli.config.as_deref());
    cfg.apply_env_overrides();
    cli.apply_to(&mut cfg);

    let mut mapping = MappingConfig::load_or_default(cfg.mapping_path.as_deref());
    cli.apply_to_mapping(&mut mapping);

    print_banner(&cfg);

    let (cmd_tx, cmd_rx) = mpsc::channel::<BridgeCommand>(256);

    let hub = match SessionHub::bind(&cfg.listen_addr(), cmd_tx.clone()).await {
        Ok(hub) => hub,
        Err(e) => {
            error!(error = %e, "cannot bind the session hub");
            eprintln!("{}: {e}", "error".red().bold());
            std::process::exit(1);
        }
    };

    let bridge = Bridge::new(cfg.clone(), mapping, driver_factory(cfg.dry_run));
    let actor = tokio::spawn(bridge.run(cmd_rx));
    tokio::spawn(hub.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received; shutting down"),
        Err(e) => error!(error = %e, "signal handler failed; shutting down"),
    }
    println!();
    println!("{}", "  disarming and exiting …".yellow());

    // The actor disarms the hand on its way out.
    let _ = cmd_tx.send(BridgeCommand::Shutdown).await;
    let _ = actor.await;
    println!("{}", "  done.".green());
}
