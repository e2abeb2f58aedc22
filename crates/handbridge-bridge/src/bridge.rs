//! The bridge actor: one task that owns every piece of mutable control
//! state and multiplexes the independent timing domains.
//!
//! Sessions never touch state directly; they enqueue [`BridgeCommand`]s
//! and receive [`ServerMessage`]s through bounded per-session queues.  The
//! actor's `select!` loop interleaves the control tick, the telemetry
//! tick, the watchdog tick, the reconnect timer, and the command channel,
//! so a slow transport or a hung observer can never stall control.
//!
//! Field ownership is single-writer by construction: the actor owns the
//! arm state machine, the safety filter, and the connector; everything
//! outside sees state only through broadcasts.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use handbridge_control::{
    derive_open_closed, map_frame, safe_open_pose, ArmStateMachine, HandAction, InputWatchdog,
    MappingConfig, ResetKind, SafetyFilter,
};
use handbridge_hal::{DriverFactory, HandConnector};
use handbridge_types::proto::{ClientMessage, ServerMessage, StatusReport, TelemetrySample};
use handbridge_types::{
    any_joint_error, ArmState, ExtensionFrame, JointErrorCodes, JointMatrix,
};

use crate::config::{BridgeConfig, CURRENT_LIMIT_MAX_MA};

/// Watchdog staleness checks run at this fixed rate.
const WATCHDOG_TICK_HZ: f64 = 4.0;
/// Reconnect attempts are considered once per second; the connector's own
/// backoff decides whether one actually runs.
const RECONNECT_TICK_S: f64 = 1.0;
/// Outbound queue depth per session before messages are dropped for it.
pub const SESSION_QUEUE_DEPTH: usize = 64;
/// Recovery paths back further off the hard stops while errors persist.
const FAULT_OPEN_MARGIN: f64 = 0.25;

/// Everything a session task can ask of the actor.
#[derive(Debug)]
pub enum BridgeCommand {
    /// A new session connected; `tx` is its outbound queue.
    Attach {
        id: Uuid,
        tx: mpsc::Sender<ServerMessage>,
    },
    /// The session's socket closed.
    Detach { id: Uuid },
    /// A parsed message from this session.
    Client { id: Uuid, msg: ClientMessage },
    /// Stop the actor (process shutdown only).
    Shutdown,
}

struct Session {
    tx: mpsc::Sender<ServerMessage>,
    /// Set on the first `hello`; broadcasts only reach observers, which
    /// guarantees the handshake status is the first message a client sees.
    observer: bool,
}

/// The bridge actor.  Construct with [`Bridge::new`], then either drive
/// it from a runtime with [`Bridge::run`] or call the tick methods
/// directly (tests do the latter with a simulated clock).
pub struct Bridge {
    cfg: BridgeConfig,
    mapping: MappingConfig,
    connector: HandConnector,
    machine: ArmStateMachine,
    filter: SafetyFilter,
    watchdog: InputWatchdog,
    sessions: HashMap<Uuid, Session>,

    /// Freshest accepted pose frame; newer always replaces older.
    frame: Option<ExtensionFrame>,
    open_pose: Option<JointMatrix>,
    closed_pose: Option<JointMatrix>,
    weights: JointMatrix,

    /// Newest measured joint position (telemetry cadence, may be stale).
    last_actual: Option<JointMatrix>,
    last_errors: Option<JointErrorCodes>,

    /// Accepted frame arrival times over the trailing second.
    cmd_times: VecDeque<Instant>,
    last_status: Option<StatusReport>,
    last_control_tick: Option<Instant>,
    /// Whether the previous control tick wrote a target; the filter is
    /// re-seeded from the measured position when writing resumes.
    was_writing: bool,
    stale_latched: bool,
    /// Connection state seen by the previous loss check; losing the
    /// device while armed is the one hardware error that disarms.
    hw_was_connected: bool,
    /// Per-request current override from a `hard_unjam` payload.
    recovery_current_ma: Option<u32>,
}

impl Bridge {
    pub fn new(cfg: BridgeConfig, mapping: MappingConfig, factory: DriverFactory) -> Self {
        let connector = HandConnector::new(cfg.selector(), factory);
        let machine = ArmStateMachine::new(cfg.timings());
        let watchdog = InputWatchdog::new(cfg.watchdog_timeout());
        let weights = mapping.finger_weights.to_matrix();
        Self {
            cfg,
            mapping,
            connector,
            machine,
            filter: SafetyFilter::new(),
            watchdog,
            sessions: HashMap::new(),
            frame: None,
            open_pose: None,
            closed_pose: None,
            weights,
            last_actual: None,
            last_errors: None,
            cmd_times: VecDeque::new(),
            last_status: None,
            last_control_tick: None,
            was_writing: false,
            stale_latched: false,
            hw_was_connected: false,
            recovery_current_ma: None,
        }
    }

    pub fn arm_state(&self) -> ArmState {
        self.machine.state()
    }

    /// Drive the actor until shutdown.  All timing domains live here; no
    /// branch awaits anything slower than a channel operation.
    pub async fn run(mut self, mut commands: mpsc::Receiver<BridgeCommand>) {
        let mut control = interval(self.cfg.control_period());
        control.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut telemetry = interval(self.cfg.telemetry_period());
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = interval(Duration::from_secs_f64(1.0 / WATCHDOG_TICK_HZ));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconnect = interval(Duration::from_secs_f64(RECONNECT_TICK_S));
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = control.tick() => self.control_tick(Instant::now()),
                _ = telemetry.tick() => self.telemetry_tick(Instant::now()),
                _ = watchdog.tick() => self.watchdog_tick(Instant::now()),
                _ = reconnect.tick() => self.reconnect_tick(Instant::now()),
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd, Instant::now()) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        info!("bridge actor stopped");
        // Leave the hand safe on the way out.
        let actions = self.machine.set_armed(false, Instant::now());
        self.execute(&actions);
    }

    // ── Command handling ───────────────────────────────────────────────────

    /// Apply one command.  Returns `false` when the actor should stop.
    pub fn handle_command(&mut self, cmd: BridgeCommand, now: Instant) -> bool {
        match cmd {
            BridgeCommand::Attach { id, tx } => {
                debug!(session = %id, "session attached");
                self.sessions.insert(
                    id,
                    Session {
                        tx,
                        observer: false,
                    },
                );
            }
            BridgeCommand::Detach { id } => {
                debug!(session = %id, "session detached");
                self.sessions.remove(&id);
                if self.sessions.is_empty() && self.cfg.disarm_on_last_disconnect {
                    info!("last session gone; disarming per policy");
                    let actions = self.machine.set_armed(false, now);
                    self.execute(&actions);
                    self.on_disarmed();
                    self.sync_status();
                }
            }
            BridgeCommand::Client { id, msg } => self.handle_client(id, msg, now),
            BridgeCommand::Shutdown => return false,
        }
        true
    }

    fn handle_client(&mut self, id: Uuid, msg: ClientMessage, now: Instant) {
        match msg {
            ClientMessage::Hello => {
                let status = self.current_status();
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.observer = true;
                    // Exactly one status reply, before any broadcast can
                    // reach this session.
                    if session.tx.try_send(ServerMessage::Status(status)).is_err() {
                        debug!(session = %id, "hello reply dropped; queue unavailable");
                    }
                }
            }
            ClientMessage::HandData { .. } => {
                if let Some(frame) = msg.as_frame() {
                    self.frame = Some(frame);
                    self.watchdog.frame_received(now);
                    self.cmd_times.push_back(now);
                }
            }
            ClientMessage::Arm { enabled } => {
                if enabled && !self.connector.is_connected() {
                    // Arming is the strongest signal the operator wants the
                    // hand now; skip any pending backoff.
                    if self.connector.maybe_connect(now, true) {
                        self.on_connected();
                    }
                }
                let actions = self.machine.set_armed(enabled, now);
                self.execute(&actions);
                if !enabled {
                    self.on_disarmed();
                }
                self.sync_status();
            }
            ClientMessage::ResetOpen => {
                let actions = self.machine.request_recovery(ResetKind::Manual, now, None);
                self.execute(&actions);
                self.sync_status();
            }
            ClientMessage::HardUnjam {
                current_ma,
                disable_s,
            } => {
                self.recovery_current_ma = current_ma.map(|ma| ma.min(CURRENT_LIMIT_MAX_MA));
                let actions = self
                    .machine
                    .request_recovery(ResetKind::Hard, now, disable_s);
                self.execute(&actions);
                self.sync_status();
            }
            ClientMessage::Connect => {
                if !self.connector.is_connected() && self.connector.maybe_connect(now, true) {
                    self.on_connected();
                }
                self.sync_status();
            }
        }
    }

    // ── Timing domains ─────────────────────────────────────────────────────

    /// One control tick: pick a desired target, filter it, write it.
    pub fn control_tick(&mut self, now: Instant) {
        let dt = self
            .last_control_tick
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or_else(|| self.cfg.control_period().as_secs_f64());
        self.last_control_tick = Some(now);

        let state = self.machine.state();
        if !state.writes_allowed() {
            self.filter.clear();
            self.was_writing = false;
            return;
        }

        let Some(limits) = self.connector.limits().copied() else {
            // Armed before the first connect ever succeeded: there is no
            // calibration to drive against, but the reset deadline still
            // has to be able to complete so arming is not wedged forever.
            let zero = JointMatrix::zeros();
            let errors = self.last_errors.as_ref().is_some_and(any_joint_error);
            let outcome = self.machine.tick(now, None, &zero, errors);
            self.execute(&outcome.actions);
            if outcome.finished {
                self.sync_status();
            }
            self.was_writing = false;
            return;
        };
        let (Some(open), Some(closed)) = (self.open_pose, self.closed_pose) else {
            self.was_writing = false;
            return;
        };

        let errors = self.last_errors.as_ref().is_some_and(any_joint_error);
        let margin = if self.machine.reset_active() && errors {
            FAULT_OPEN_MARGIN
        } else {
            self.mapping.open_margin
        };
        let release = safe_open_pose(&open, &closed, &limits, margin);

        let outcome = self
            .machine
            .tick(now, self.last_actual.as_ref(), &release, errors);
        self.execute(&outcome.actions);
        if outcome.finished {
            self.sync_status();
        }

        let desired = if self.machine.reset_active() {
            // Tracking frames are accepted but never applied here; only
            // the staged open trajectory drives the filter.
            let hold = self
                .last_actual
                .or_else(|| self.filter.last().copied())
                .unwrap_or(release);
            self.machine.recovery_target(&release, &hold)
        } else if self.watchdog.is_stale(now) {
            Some(release)
        } else if let Some(frame) = &self.frame {
            Some(map_frame(
                frame,
                &open,
                &closed,
                &self.weights,
                self.mapping.max_curl,
            ))
        } else {
            None
        };

        let Some(desired) = desired else {
            self.was_writing = false;
            return;
        };

        if !self.was_writing {
            // Control is resuming after a non-writing period: step from
            // where the hand actually is, not from a remembered target.
            if let Some(actual) = self.connector.read_actual_position() {
                self.filter
                    .reset_to(actual.clamp(&limits.floor(), &limits.ceil()));
            }
        }

        let params = if state.in_recovery() {
            self.cfg.recovery_filter()
        } else {
            self.cfg.tracking_filter()
        };
        let filtered = self.filter.apply(&desired, dt, &params, &limits);
        self.was_writing = self.connector.write_target(&filtered);
        if !self.was_writing {
            self.check_hardware_loss(now);
            self.sync_status();
        }
    }

    /// One telemetry tick: poll hardware, react to faults, broadcast.
    pub fn telemetry_tick(&mut self, now: Instant) {
        if let Some(readout) = self.connector.read_telemetry() {
            self.last_actual = Some(readout.position);
            self.last_errors = Some(readout.error_codes);

            if self.cfg.auto_unjam_on_error
                && any_joint_error(&readout.error_codes)
                && self.machine.state() == ArmState::Armed
            {
                let actions = self.machine.observe_fault(now);
                self.execute(&actions);
            }

            let sample = self.sample(now, Some(readout.input_voltage));
            self.broadcast(ServerMessage::Telemetry(sample));
        } else {
            if !self.connector.is_connected() {
                self.last_actual = None;
                self.last_errors = None;
            }
            let sample = self.sample(now, None);
            self.broadcast(ServerMessage::Telemetry(sample));
        }
        // Reads may have dropped the connection or surfaced a new error.
        self.check_hardware_loss(now);
        self.sync_status();
    }

    /// Watchdog staleness check.  The forced release itself flows through
    /// the control tick; this domain only owns the edge logging.
    pub fn watchdog_tick(&mut self, now: Instant) {
        let stale = self.machine.state() == ArmState::Armed && self.watchdog.is_stale(now);
        if stale && !self.stale_latched {
            warn!(
                timeout_s = self.cfg.watchdog_s,
                "tracking input stale; releasing to open pose"
            );
        }
        self.stale_latched = stale;
    }

    /// Reconnect timer: lets the connector's backoff decide.
    pub fn reconnect_tick(&mut self, now: Instant) {
        if self.connector.maybe_connect(now, false) {
            self.on_connected();
        }
        self.sync_status();
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn on_connected(&mut self) {
        let Some(limits) = self.connector.limits().copied() else {
            return;
        };
        let initial = self.connector.initial_position().copied();
        let (open, closed) = derive_open_closed(&limits, initial.as_ref(), &self.mapping);
        self.open_pose = Some(open);
        self.closed_pose = Some(closed);
        self.last_actual = initial;
        self.hw_was_connected = true;
        info!("calibration loaded; poses derived");
    }

    fn on_disarmed(&mut self) {
        self.filter.clear();
        self.watchdog.clear();
        self.frame = None;
        self.was_writing = false;
    }

    /// Losing the device mid-session while motion is permitted is the one
    /// hardware error treated as fatal to the arm session (never to the
    /// process): drop straight to disarmed.  Arming before the hardware
    /// ever connected is untouched; the backoff loop keeps retrying.
    fn check_hardware_loss(&mut self, now: Instant) {
        let connected = self.connector.is_connected();
        if self.hw_was_connected && !connected && self.machine.state().writes_allowed() {
            warn!("hardware lost while armed; disarming");
            let actions = self.machine.set_armed(false, now);
            self.execute(&actions);
            self.on_disarmed();
        }
        self.hw_was_connected = connected;
    }

    fn execute(&mut self, actions: &[HandAction]) {
        for action in actions {
            match action {
                HandAction::EnableTorque => {
                    self.connector.set_torque(true);
                }
                HandAction::DisableTorque => {
                    self.connector.set_torque(false);
                }
                HandAction::ClearJointErrors => {
                    self.connector.clear_joint_errors();
                }
                HandAction::LowerCurrentLimit => {
                    let ma = self.recovery_current_ma.unwrap_or(self.cfg.unjam_current_ma);
                    self.connector.set_current_limit(ma);
                }
                HandAction::RestoreCurrentLimit => {
                    self.recovery_current_ma = None;
                    self.connector.set_current_limit(self.cfg.normal_current_ma);
                }
            }
        }
    }

    fn current_status(&self) -> StatusReport {
        let info = self.connector.device_info();
        StatusReport {
            has_hardware: self.connector.is_connected(),
            armed: self.machine.state() != ArmState::Disarmed,
            arm_state: self.machine.state(),
            last_hw_error: self.connector.last_error().map(str::to_string),
            serial: info.and_then(|i| i.serial.clone()),
            firmware_version: info.and_then(|i| i.firmware_version.clone()),
            handedness: info.and_then(|i| i.handedness.clone()),
        }
    }

    /// Broadcast the status snapshot iff it changed since the last one.
    fn sync_status(&mut self) {
        let status = self.current_status();
        if self.last_status.as_ref() == Some(&status) {
            return;
        }
        self.last_status = Some(status.clone());
        self.broadcast(ServerMessage::Status(status));
    }

    fn sample(&mut self, now: Instant, input_voltage: Option<f64>) -> TelemetrySample {
        TelemetrySample {
            ts: chrono::Utc::now().timestamp_millis(),
            input_voltage,
            joint_actual_position: self.last_actual,
            joint_error_code: self.last_errors,
            cmd_hz: self.cmd_hz(now),
            cmd_age_ms: self
                .watchdog
                .frame_age(now)
                .map(|age| age.as_millis() as i64),
            reset_active: self.machine.reset_active(),
            reset_phase: self.machine.reset_phase(),
            reset_label: self.machine.reset_label().to_string(),
            reset_reason: self.machine.reset_reason().to_string(),
        }
    }

    /// Accepted frame rate over the trailing second.
    fn cmd_hz(&mut self, now: Instant) -> f64 {
        while let Some(&front) = self.cmd_times.front() {
            if now.saturating_duration_since(front) > Duration::from_secs(1) {
                self.cmd_times.pop_front();
            } else {
                break;
            }
        }
        self.cmd_times.len() as f64
    }

    /// Push to every observer.  A full queue drops the message for that
    /// session only; a closed queue marks the session dead.
    fn broadcast(&mut self, msg: ServerMessage) {
        let mut dead = Vec::new();
        for (id, session) in &self.sessions {
            if !session.observer {
                continue;
            }
            match session.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(session = %id, "observer queue full; message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.sessions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handbridge_hal::{HandDriver, SimHand};
    use handbridge_types::proto::Extensions;
    use handbridge_types::HandSide;

    fn sim_factory(sim: SimHand) -> DriverFactory {
        Box::new(move |_| Ok(Box::new(sim.clone()) as Box<dyn HandDriver>))
    }

    fn quick_cfg() -> BridgeConfig {
        BridgeConfig {
            // Short dwells and deadlines keep the simulated clock walks small.
            arm_reset_s: 6.0,
            watchdog_s: 1.0,
            ..Default::default()
        }
    }

    fn bridge_with(cfg: BridgeConfig) -> (Bridge, SimHand) {
        let sim = SimHand::new();
        let bridge = Bridge::new(cfg, MappingConfig::default(), sim_factory(sim.clone()));
        (bridge, sim)
    }

    fn connected_bridge() -> (Bridge, SimHand, Instant) {
        let (mut bridge, sim) = bridge_with(quick_cfg());
        let t0 = Instant::now();
        bridge.reconnect_tick(t0);
        assert!(bridge.connector.is_connected());
        (bridge, sim, t0)
    }

    fn attach_observer(bridge: &mut Bridge, now: Instant) -> (Uuid, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        bridge.handle_command(BridgeCommand::Attach { id, tx }, now);
        bridge.handle_command(
            BridgeCommand::Client {
                id,
                msg: ClientMessage::Hello,
            },
            now,
        );
        (id, rx)
    }

    fn frame_msg(ext: f64) -> ClientMessage {
        ClientMessage::HandData {
            side: HandSide::Right,
            extensions: Extensions::from_array([ext; 5]),
            spread: None,
        }
    }

    fn send(bridge: &mut Bridge, id: Uuid, msg: ClientMessage, now: Instant) {
        bridge.handle_command(BridgeCommand::Client { id, msg }, now);
    }

    /// Walk the bridge through arm + the staged open reset until Armed.
    fn arm_fully(bridge: &mut Bridge, id: Uuid, t0: Instant) -> Instant {
        send(bridge, id, ClientMessage::Arm { enabled: true }, t0);
        assert_eq!(bridge.arm_state(), ArmState::Resetting);
        let mut now = t0;
        for _ in 0..400 {
            now += Duration::from_millis(100);
            bridge.telemetry_tick(now);
            bridge.control_tick(now);
            if bridge.arm_state() == ArmState::Armed {
                return now;
            }
        }
        panic!("never finished arming; state={:?}", bridge.arm_state());
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn hello_gets_exactly_one_status_before_any_broadcast() {
        let (mut bridge, _sim, t0) = connected_bridge();

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        bridge.handle_command(BridgeCommand::Attach { id, tx }, t0);

        // Status churn before the handshake must not reach the session.
        bridge.telemetry_tick(t0);
        bridge.reconnect_tick(t0);
        assert!(rx.try_recv().is_err());

        send(&mut bridge, id, ClientMessage::Hello, t0);
        let first = rx.try_recv().expect("hello reply");
        match first {
            ServerMessage::Status(s) => {
                assert!(s.has_hardware);
                assert!(!s.armed);
                assert_eq!(s.arm_state, ArmState::Disarmed);
                assert_eq!(s.serial.as_deref(), Some("SIM-0001"));
            }
            other => panic!("expected status, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "exactly one reply to hello");
    }

    #[test]
    fn arm_transition_broadcasts_to_every_observer() {
        let (mut bridge, _sim, t0) = connected_bridge();
        let (a, mut rx_a) = attach_observer(&mut bridge, t0);
        let (_b, mut rx_b) = attach_observer(&mut bridge, t0);
        drain(&mut rx_a);
        drain(&mut rx_b);

        // Session A triggers the change; both sessions must see it.
        send(&mut bridge, a, ClientMessage::Arm { enabled: true }, t0);
        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = drain(rx);
            let status = msgs.iter().find_map(|m| match m {
                ServerMessage::Status(s) => Some(s),
                _ => None,
            });
            let status = status.expect("status broadcast");
            assert!(status.armed);
            assert_eq!(status.arm_state, ArmState::Resetting);
        }
    }

    #[test]
    fn full_arm_cycle_reaches_armed_and_restores_current() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);

        arm_fully(&mut bridge, id, t0);
        assert_eq!(bridge.arm_state(), ArmState::Armed);
        assert!(sim.torque_enabled());
        assert_eq!(sim.current_limit_ma(), 1000);
    }

    #[test]
    fn tracking_frames_drive_targets_within_limits() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);
        let mut now = arm_fully(&mut bridge, id, t0);

        // Fully curled request, deliberately out of range.
        for _ in 0..200 {
            now += Duration::from_millis(20);
            send(&mut bridge, id, frame_msg(-250.0), now);
            bridge.control_tick(now);
            assert!(
                SimHand::default_limits().contains(&sim.target()),
                "target escaped joint limits"
            );
        }
        // Default mapping: open at the upper limit, curl pulls toward lower.
        let limits = SimHand::default_limits();
        let open = limits.upper;
        assert!(
            sim.target().max_abs_diff(&open) > 0.3,
            "hand should have curled away from open"
        );
    }

    #[test]
    fn filtered_steps_respect_speed_limit() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);
        let mut now = arm_fully(&mut bridge, id, t0);

        let dt = 0.02;
        let max_step = 2.0 * dt + 1e-9;
        let mut prev = sim.target();
        for i in 0..150 {
            now += Duration::from_secs_f64(dt);
            // Alternate between fully open and fully curled requests.
            send(&mut bridge, id, frame_msg(if i % 2 == 0 { 0.0 } else { 100.0 }), now);
            bridge.control_tick(now);
            let cur = sim.target();
            assert!(
                cur.max_abs_diff(&prev) <= max_step,
                "step exceeded max_speed*dt at iteration {i}"
            );
            prev = cur;
        }
    }

    #[test]
    fn watchdog_silence_releases_to_open_pose() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);
        let mut now = arm_fully(&mut bridge, id, t0);

        // Track closed for a while.
        for _ in 0..100 {
            now += Duration::from_millis(20);
            send(&mut bridge, id, frame_msg(0.0), now);
            bridge.control_tick(now);
        }
        let limits = SimHand::default_limits();
        let release = safe_open_pose(
            &limits.upper,
            &limits.lower,
            &limits,
            MappingConfig::default().open_margin,
        );
        assert!(sim.target().max_abs_diff(&release) > 0.3);

        // Then the tracking client dies: no frames for > watchdog_s.
        now += Duration::from_secs(2);
        bridge.watchdog_tick(now);
        for _ in 0..600 {
            now += Duration::from_millis(20);
            bridge.control_tick(now);
        }
        assert!(
            sim.target().max_abs_diff(&release) < 1e-6,
            "hand should have converged to the safe open pose"
        );
        // Watchdog releases without disturbing the arm state.
        assert_eq!(bridge.arm_state(), ArmState::Armed);
    }

    #[test]
    fn disarm_mid_reset_stops_writes_immediately() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);

        send(&mut bridge, id, ClientMessage::Arm { enabled: true }, t0);
        assert_eq!(bridge.arm_state(), ArmState::Resetting);
        let mut now = t0 + Duration::from_millis(700);
        bridge.control_tick(now);

        send(&mut bridge, id, ClientMessage::Arm { enabled: false }, now);
        assert_eq!(bridge.arm_state(), ArmState::Disarmed);
        assert!(!sim.torque_enabled());

        let writes = sim.target_writes();
        for _ in 0..50 {
            now += Duration::from_millis(20);
            send(&mut bridge, id, frame_msg(0.0), now);
            bridge.control_tick(now);
        }
        assert_eq!(sim.target_writes(), writes, "no motion writes after disarm");
    }

    #[test]
    fn joint_fault_triggers_auto_unjam_and_recovers() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);
        let mut now = arm_fully(&mut bridge, id, t0);

        sim.inject_joint_error(2, 1, 21);
        now += Duration::from_millis(100);
        bridge.telemetry_tick(now);
        assert_eq!(bridge.arm_state(), ArmState::Unjamming);
        assert_eq!(sim.current_limit_ma(), 500, "current lowered for recovery");

        // The recovery sequence clears the fault and walks the hand open.
        for _ in 0..800 {
            now += Duration::from_millis(100);
            bridge.telemetry_tick(now);
            bridge.control_tick(now);
            if bridge.arm_state() == ArmState::Armed {
                break;
            }
        }
        assert_eq!(bridge.arm_state(), ArmState::Armed);
        assert_eq!(sim.current_limit_ma(), 1000, "current restored after recovery");
    }

    #[test]
    fn frames_during_recovery_are_accepted_but_not_applied() {
        // Hand resting open; a wide margin keeps the reset sequence busy
        // long enough to observe it ignoring tracking input.
        let sim = SimHand::new();
        sim.set_position(SimHand::default_limits().upper);
        let mapping = MappingConfig {
            open_margin: 0.30,
            ..Default::default()
        };
        let mut bridge = Bridge::new(quick_cfg(), mapping, sim_factory(sim.clone()));
        let t0 = Instant::now();
        bridge.reconnect_tick(t0);
        let (id, _rx) = attach_observer(&mut bridge, t0);

        send(&mut bridge, id, ClientMessage::Arm { enabled: true }, t0);
        let mut now = t0 + Duration::from_secs(1);
        bridge.telemetry_tick(now);
        bridge.control_tick(now);
        assert!(bridge.machine.reset_active());

        // A fully-curled frame arrives mid-reset; the reset trajectory
        // keeps opening the hand instead of curling it.
        for _ in 0..40 {
            now += Duration::from_millis(50);
            send(&mut bridge, id, frame_msg(0.0), now);
            bridge.telemetry_tick(now);
            bridge.control_tick(now);
            if !bridge.machine.reset_active() {
                break;
            }
        }
        let limits = SimHand::default_limits();
        let closed_dist = sim.target().max_abs_diff(&limits.lower);
        let open_dist = sim.target().max_abs_diff(&limits.upper);
        assert!(
            open_dist < closed_dist,
            "reset target should sit near open, not the curled request"
        );
    }

    #[test]
    fn hard_unjam_applies_current_override_then_restores() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);
        let mut now = arm_fully(&mut bridge, id, t0);

        send(
            &mut bridge,
            id,
            ClientMessage::HardUnjam {
                current_ma: Some(300),
                disable_s: Some(0.5),
            },
            now,
        );
        assert_eq!(bridge.arm_state(), ArmState::Unjamming);
        assert_eq!(sim.current_limit_ma(), 300);

        for _ in 0..800 {
            now += Duration::from_millis(100);
            bridge.telemetry_tick(now);
            bridge.control_tick(now);
            if bridge.arm_state() == ArmState::Armed {
                break;
            }
        }
        assert_eq!(bridge.arm_state(), ArmState::Armed);
        assert_eq!(sim.current_limit_ma(), 1000);
    }

    #[test]
    fn last_write_wins_across_sessions() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (a, _rx_a) = attach_observer(&mut bridge, t0);
        let (b, _rx_b) = attach_observer(&mut bridge, t0);
        let mut now = arm_fully(&mut bridge, a, t0);

        // A asks fully open, then B asks fully curled: B wins.
        now += Duration::from_millis(20);
        send(&mut bridge, a, frame_msg(100.0), now);
        send(&mut bridge, b, frame_msg(0.0), now);
        for _ in 0..400 {
            now += Duration::from_millis(20);
            bridge.control_tick(now);
        }
        let limits = SimHand::default_limits();
        let closed_dist = sim.target().max_abs_diff(&limits.lower);
        let open_dist = sim.target().max_abs_diff(&limits.upper);
        assert!(closed_dist < open_dist, "the newest frame should win");
    }

    #[test]
    fn telemetry_reports_rate_age_and_positions() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, mut rx) = attach_observer(&mut bridge, t0);
        drain(&mut rx);

        sim.set_input_voltage(11.7);
        let mut now = t0;
        for _ in 0..5 {
            now += Duration::from_millis(100);
            send(&mut bridge, id, frame_msg(50.0), now);
        }
        bridge.telemetry_tick(now);

        let msgs = drain(&mut rx);
        let sample = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::Telemetry(t) => Some(t),
                _ => None,
            })
            .expect("telemetry broadcast");
        assert!((sample.cmd_hz - 5.0).abs() < 1e-9);
        assert_eq!(sample.cmd_age_ms, Some(0));
        assert_eq!(sample.input_voltage, Some(11.7));
        assert!(sample.joint_actual_position.is_some());
        assert!(!sample.reset_active);
    }

    #[test]
    fn disconnect_surfaces_in_status_and_reconnect_recovers() {
        let (mut bridge, _sim, t0) = connected_bridge();
        let (_id, mut rx) = attach_observer(&mut bridge, t0);
        drain(&mut rx);

        bridge.connector.mark_disconnected("unplugged");
        bridge.telemetry_tick(t0 + Duration::from_millis(100));
        let msgs = drain(&mut rx);
        let status = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::Status(s) => Some(s),
                _ => None,
            })
            .expect("disconnect status");
        assert!(!status.has_hardware);
        assert_eq!(status.last_hw_error.as_deref(), Some("unplugged"));

        // The reconnect domain brings it back without operator action.
        bridge.reconnect_tick(t0 + Duration::from_secs(5));
        let msgs = drain(&mut rx);
        let status = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::Status(s) => Some(s),
                _ => None,
            })
            .expect("reconnect status");
        assert!(status.has_hardware);
    }

    #[test]
    fn hardware_loss_while_armed_disarms() {
        let (mut bridge, _sim, t0) = connected_bridge();
        let (id, mut rx) = attach_observer(&mut bridge, t0);
        let now = arm_fully(&mut bridge, id, t0);
        drain(&mut rx);

        bridge.connector.mark_disconnected("cable pulled");
        bridge.telemetry_tick(now + Duration::from_millis(100));
        assert_eq!(bridge.arm_state(), ArmState::Disarmed);

        let msgs = drain(&mut rx);
        let status = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::Status(s) => Some(s),
                _ => None,
            })
            .expect("loss status");
        assert!(!status.armed);
        assert!(!status.has_hardware);
    }

    #[test]
    fn disarm_on_last_disconnect_policy() {
        let cfg = BridgeConfig {
            disarm_on_last_disconnect: true,
            ..quick_cfg()
        };
        let (mut bridge, _sim) = bridge_with(cfg);
        let t0 = Instant::now();
        bridge.reconnect_tick(t0);
        let (id, _rx) = attach_observer(&mut bridge, t0);
        arm_fully(&mut bridge, id, t0);

        bridge.handle_command(BridgeCommand::Detach { id }, t0 + Duration::from_secs(60));
        assert_eq!(bridge.arm_state(), ArmState::Disarmed);
    }

    #[test]
    fn detach_keeps_arm_state_by_default() {
        let (mut bridge, _sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);
        arm_fully(&mut bridge, id, t0);

        bridge.handle_command(BridgeCommand::Detach { id }, t0 + Duration::from_secs(60));
        assert_eq!(bridge.arm_state(), ArmState::Armed);
    }

    #[test]
    fn recovery_request_while_disarmed_is_ignored() {
        let (mut bridge, sim, t0) = connected_bridge();
        let (id, _rx) = attach_observer(&mut bridge, t0);

        send(&mut bridge, id, ClientMessage::ResetOpen, t0);
        assert_eq!(bridge.arm_state(), ArmState::Disarmed);
        assert_eq!(sim.target_writes(), 0);
    }

    #[test]
    fn shutdown_command_stops_the_actor() {
        let (mut bridge, _sim, t0) = connected_bridge();
        assert!(bridge.handle_command(
            BridgeCommand::Client {
                id: Uuid::new_v4(),
                msg: ClientMessage::Hello
            },
            t0
        ));
        assert!(!bridge.handle_command(BridgeCommand::Shutdown, t0));
    }

    #[test]
    fn slow_observer_is_isolated_not_fatal() {
        let (mut bridge, _sim, t0) = connected_bridge();
        let id = Uuid::new_v4();
        // Queue depth of one fills immediately.
        let (tx, mut rx) = mpsc::channel(1);
        bridge.handle_command(BridgeCommand::Attach { id, tx }, t0);
        send(&mut bridge, id, ClientMessage::Hello, t0);

        // The hello reply fills the queue; later broadcasts are dropped
        // for this session without disturbing the bridge.
        let mut now = t0;
        for _ in 0..10 {
            now += Duration::from_millis(100);
            bridge.telemetry_tick(now);
        }
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Status(_))));
        assert_eq!(bridge.sessions.len(), 1);
    }
}
