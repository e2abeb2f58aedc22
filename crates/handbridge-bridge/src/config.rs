//! Process configuration for the bridge binary.
//!
//! Layered the usual way: compiled-in defaults, then an optional TOML
//! file, then `HANDBRIDGE_*` environment variables, then CLI flags (the
//! binary applies those last).  A malformed file logs a warning and the
//! defaults are used; configuration can never block startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use handbridge_control::{ArmTimings, FilterParams};
use handbridge_hal::DeviceSelector;
use handbridge_types::BridgeError;

/// Hard ceiling from the hardware docs for current-limit writes.
pub const CURRENT_LIMIT_MAX_MA: u32 = 3000;

/// Everything the bridge process can be told from outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// WebSocket listen address.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// USB vendor id of the hand.
    #[serde(default = "default_usb_vid")]
    pub usb_vid: u16,
    /// USB product id; `None` matches any.
    #[serde(default)]
    pub usb_pid: Option<u16>,
    /// USB serial number, when several hands are attached.
    #[serde(default)]
    pub serial: Option<String>,

    /// Control tick rate.
    #[serde(default = "default_control_hz")]
    pub control_hz: f64,
    /// Telemetry poll/broadcast rate.
    #[serde(default = "default_telemetry_hz")]
    pub telemetry_hz: f64,
    /// Seconds without a tracking frame before the hand is released.
    /// 0 disables the watchdog.
    #[serde(default = "default_watchdog_s")]
    pub watchdog_s: f64,

    /// Max joint target speed while tracking, rad/s.  0 disables limiting.
    #[serde(default = "default_max_speed")]
    pub max_speed_rad_s: f64,
    /// Max joint target speed during reset/unjam, rad/s.  Kept very low;
    /// the current limit is reduced at the same time.
    #[serde(default = "default_unjam_max_speed")]
    pub unjam_max_speed_rad_s: f64,
    /// Smoothing coefficient for the safety filter.
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,

    /// Joint current limit in normal operation, mA.
    #[serde(default = "default_normal_current_ma")]
    pub normal_current_ma: u32,
    /// Reduced joint current limit during reset/unjam, mA.
    #[serde(default = "default_unjam_current_ma")]
    pub unjam_current_ma: u32,
    /// Enter recovery automatically when a joint error appears while armed.
    #[serde(default = "default_true")]
    pub auto_unjam_on_error: bool,

    /// Deadline for the open-on-arm reset, seconds.
    #[serde(default = "default_arm_reset_s")]
    pub arm_reset_s: f64,
    /// Deadline for manual/auto recovery, seconds.
    #[serde(default = "default_reset_open_s")]
    pub reset_open_s: f64,
    /// A finger counts as open within this many radians of the open pose.
    #[serde(default = "default_reset_threshold")]
    pub reset_threshold_rad: f64,

    /// Drop to disarmed when the last observer disconnects.
    #[serde(default)]
    pub disarm_on_last_disconnect: bool,

    /// Optional mapping (weights + pose mode) file.
    #[serde(default)]
    pub mapping_path: Option<PathBuf>,
    /// Substitute the in-process simulator for the real transport.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_usb_vid() -> u16 {
    0x0483
}
fn default_control_hz() -> f64 {
    50.0
}
fn default_telemetry_hz() -> f64 {
    10.0
}
fn default_watchdog_s() -> f64 {
    1.0
}
fn default_max_speed() -> f64 {
    2.0
}
fn default_unjam_max_speed() -> f64 {
    0.12
}
fn default_smoothing_alpha() -> f64 {
    0.35
}
fn default_normal_current_ma() -> u32 {
    1000
}
fn default_unjam_current_ma() -> u32 {
    500
}
fn default_true() -> bool {
    true
}
fn default_arm_reset_s() -> f64 {
    8.0
}
fn default_reset_open_s() -> f64 {
    60.0
}
fn default_reset_threshold() -> f64 {
    0.15
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            usb_vid: default_usb_vid(),
            usb_pid: None,
            serial: None,
            control_hz: default_control_hz(),
            telemetry_hz: default_telemetry_hz(),
            watchdog_s: default_watchdog_s(),
            max_speed_rad_s: default_max_speed(),
            unjam_max_speed_rad_s: default_unjam_max_speed(),
            smoothing_alpha: default_smoothing_alpha(),
            normal_current_ma: default_normal_current_ma(),
            unjam_current_ma: default_unjam_current_ma(),
            auto_unjam_on_error: true,
            arm_reset_s: default_arm_reset_s(),
            reset_open_s: default_reset_open_s(),
            reset_threshold_rad: default_reset_threshold(),
            disarm_on_last_disconnect: false,
            mapping_path: None,
            dry_run: false,
        }
    }
}

impl BridgeConfig {
    /// Parse a config file.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        let mut cfg: Self = toml::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Load `path` if given; any failure falls back to the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            None => Self::default(),
            Some(p) => match Self::load(p) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(error = %e, "bridge config rejected, using defaults");
                    Self::default()
                }
            },
        }
    }

    /// Apply `HANDBRIDGE_*` environment variable overrides.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `HANDBRIDGE_HOST` | `host` |
    /// | `HANDBRIDGE_PORT` | `port` |
    /// | `HANDBRIDGE_SERIAL` | `serial` |
    /// | `HANDBRIDGE_WATCHDOG_S` | `watchdog_s` |
    /// | `HANDBRIDGE_DRY_RUN` | `dry_run` (`1`/`true`) |
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HANDBRIDGE_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("HANDBRIDGE_PORT")
            && let Ok(port) = v.parse::<u16>()
        {
            self.port = port;
        }
        if let Ok(v) = std::env::var("HANDBRIDGE_SERIAL") {
            self.serial = Some(v);
        }
        if let Ok(v) = std::env::var("HANDBRIDGE_WATCHDOG_S")
            && let Ok(s) = v.parse::<f64>()
        {
            self.watchdog_s = s;
        }
        if let Ok(v) = std::env::var("HANDBRIDGE_DRY_RUN") {
            self.dry_run = matches!(v.as_str(), "1" | "true" | "yes");
        }
        self.sanitize();
    }

    /// Clamp numeric fields into the ranges the rest of the bridge assumes.
    pub fn sanitize(&mut self) {
        if !self.control_hz.is_finite() || self.control_hz <= 0.0 {
            self.control_hz = default_control_hz();
        }
        self.control_hz = self.control_hz.clamp(1.0, 200.0);
        if !self.telemetry_hz.is_finite() || self.telemetry_hz <= 0.0 {
            self.telemetry_hz = default_telemetry_hz();
        }
        self.telemetry_hz = self.telemetry_hz.clamp(0.5, 60.0);
        if !self.watchdog_s.is_finite() || self.watchdog_s < 0.0 {
            self.watchdog_s = default_watchdog_s();
        }
        if !self.max_speed_rad_s.is_finite() || self.max_speed_rad_s < 0.0 {
            self.max_speed_rad_s = default_max_speed();
        }
        if !self.unjam_max_speed_rad_s.is_finite() || self.unjam_max_speed_rad_s <= 0.0 {
            self.unjam_max_speed_rad_s = default_unjam_max_speed();
        }
        if !self.smoothing_alpha.is_finite() {
            self.smoothing_alpha = default_smoothing_alpha();
        }
        self.smoothing_alpha = self.smoothing_alpha.clamp(0.0, 1.0);
        self.normal_current_ma = self.normal_current_ma.min(CURRENT_LIMIT_MAX_MA);
        self.unjam_current_ma = self.unjam_current_ma.min(CURRENT_LIMIT_MAX_MA);
    }

    /// Listen address for the session hub.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Device identity for the connector.
    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector {
            usb_vid: self.usb_vid,
            usb_pid: self.usb_pid,
            serial: self.serial.clone(),
        }
    }

    /// Reset/unjam deadlines for the arm state machine.
    pub fn timings(&self) -> ArmTimings {
        ArmTimings {
            arm_reset_s: self.arm_reset_s,
            recovery_s: self.reset_open_s,
            settle_threshold_rad: self.reset_threshold_rad,
            ..ArmTimings::default()
        }
    }

    /// Safety filter tuning while tracking.
    pub fn tracking_filter(&self) -> FilterParams {
        FilterParams {
            max_speed_rad_s: self.max_speed_rad_s,
            smoothing_alpha: self.smoothing_alpha,
        }
    }

    /// Safety filter tuning during reset/unjam: much slower, no smoothing
    /// lag on top of the already conservative speed cap.
    pub fn recovery_filter(&self) -> FilterParams {
        FilterParams {
            max_speed_rad_s: self.unjam_max_speed_rad_s,
            smoothing_alpha: 1.0,
        }
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.control_hz)
    }

    pub fn telemetry_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.telemetry_hz)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.watchdog_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.port, 8765);
        assert_eq!(cfg.usb_vid, 0x0483);
        assert!((cfg.control_hz - 50.0).abs() < 1e-12);
        assert!((cfg.max_speed_rad_s - 2.0).abs() < 1e-12);
        assert!((cfg.unjam_max_speed_rad_s - 0.12).abs() < 1e-12);
        assert_eq!(cfg.normal_current_ma, 1000);
        assert_eq!(cfg.unjam_current_ma, 500);
        assert!(cfg.auto_unjam_on_error);
        assert!(!cfg.disarm_on_last_disconnect);
        assert!(!cfg.dry_run);
    }

    #[test]
    fn load_parses_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port = 9001\nwatchdog_s = 2.5\ndry_run = true").unwrap();
        let cfg = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(cfg.port, 9001);
        assert!((cfg.watchdog_s - 2.5).abs() < 1e-12);
        assert!(cfg.dry_run);
        // Everything else keeps its default.
        assert_eq!(cfg.usb_vid, 0x0483);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port = \"not a port\"").unwrap();
        assert!(BridgeConfig::load(f.path()).is_err());
        let cfg = BridgeConfig::load_or_default(Some(f.path()));
        assert_eq!(cfg, BridgeConfig::default());
    }

    #[test]
    fn sanitize_clamps_wild_values() {
        let mut cfg = BridgeConfig {
            control_hz: -3.0,
            telemetry_hz: f64::NAN,
            smoothing_alpha: 7.0,
            normal_current_ma: 50_000,
            ..Default::default()
        };
        cfg.sanitize();
        assert!((cfg.control_hz - 50.0).abs() < 1e-12);
        assert!((cfg.telemetry_hz - 10.0).abs() < 1e-12);
        assert!((cfg.smoothing_alpha - 1.0).abs() < 1e-12);
        assert_eq!(cfg.normal_current_ma, CURRENT_LIMIT_MAX_MA);
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("HANDBRIDGE_PORT", "9100");
            std::env::set_var("HANDBRIDGE_SERIAL", "WH-7");
        }
        let mut cfg = BridgeConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.serial.as_deref(), Some("WH-7"));
        unsafe {
            std::env::remove_var("HANDBRIDGE_PORT");
            std::env::remove_var("HANDBRIDGE_SERIAL");
        }
    }

    #[test]
    fn env_override_ignores_invalid_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("HANDBRIDGE_PORT", "not-a-port") };
        let mut cfg = BridgeConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.port, 8765);
        unsafe { std::env::remove_var("HANDBRIDGE_PORT") };
    }

    #[test]
    fn selector_and_timings_mirror_config() {
        let cfg = BridgeConfig {
            usb_vid: 0x1234,
            usb_pid: Some(0x5678),
            serial: Some("X".into()),
            arm_reset_s: 5.0,
            reset_open_s: 40.0,
            reset_threshold_rad: 0.2,
            ..Default::default()
        };
        let sel = cfg.selector();
        assert_eq!(sel.usb_vid, 0x1234);
        assert_eq!(sel.usb_pid, Some(0x5678));
        let t = cfg.timings();
        assert!((t.arm_reset_s - 5.0).abs() < 1e-12);
        assert!((t.recovery_s - 40.0).abs() < 1e-12);
        assert!((t.settle_threshold_rad - 0.2).abs() < 1e-12);
    }

    #[test]
    fn recovery_filter_is_slower_than_tracking() {
        let cfg = BridgeConfig::default();
        assert!(cfg.recovery_filter().max_speed_rad_s < cfg.tracking_filter().max_speed_rad_s);
    }
}
