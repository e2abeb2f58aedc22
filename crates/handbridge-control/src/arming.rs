//! Arm lifecycle state machine: `Disarmed → Resetting → Armed ⇄ Unjamming`.
//!
//! The machine gates every hardware write and owns the staged open
//! sequence used both when arming and when recovering from a mechanical
//! jam.  It performs no I/O itself: transitions return a list of
//! [`HandAction`]s that the bridge executes against the connector, and
//! ticks consume the measured joint position the bridge already has.
//! That split keeps every transition testable without hardware.
//!
//! Recovery sequence (all entry paths): lower the current limit, clear
//! latched errors, release torque for a dwell window, re-enable torque,
//! clear errors again, then drive fingers to the open pose one at a time
//! in a fixed order (index, middle, ring, pinky, thumb last).  Opening one
//! finger at a time avoids simultaneous high-current draw and matches the
//! mechanical coupling of the mechanism.  Hard unjam uses a longer dwell
//! and a more generous deadline.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use handbridge_types::{ArmState, Finger, JointMatrix};

/// Finger order of the staged open sequence; thumb always moves last.
pub const FINGER_SEQUENCE: [Finger; 5] = [
    Finger::Index,
    Finger::Middle,
    Finger::Ring,
    Finger::Pinky,
    Finger::Thumb,
];

const PHASE_LABELS: [&str; 5] = ["IDX", "MID", "RNG", "PNK", "THM"];

/// Errors keep re-latching on some devices while the hand moves; clearing
/// is throttled to stay inside the vendor's reset-error budget.
const ERROR_CLEAR_MIN_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_CLEAR_BUDGET: u32 = 20;

// ────────────────────────────────────────────────────────────────────────────
// Events out
// ────────────────────────────────────────────────────────────────────────────

/// Hardware side effects requested by a transition or tick, executed by
/// the bridge in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandAction {
    EnableTorque,
    DisableTorque,
    ClearJointErrors,
    /// Switch to the (configured) reduced recovery current limit.
    LowerCurrentLimit,
    /// Restore the normal current limit.
    RestoreCurrentLimit,
}

/// Why a recovery sequence is running; drives deadlines and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Open-on-arm reset after the operator enables motion.
    Arm,
    /// Operator-requested `reset_open`.
    Manual,
    /// Automatic recovery after a joint fault while armed.
    Auto,
    /// Operator-requested `hard_unjam`.
    Hard,
}

impl ResetKind {
    /// Telemetry string, matching what observers already render.
    pub fn reason(self) -> &'static str {
        match self {
            ResetKind::Arm => "arm",
            ResetKind::Manual => "reset",
            ResetKind::Auto => "auto",
            ResetKind::Hard => "hard",
        }
    }

    /// Failsafe spent on a single finger before moving on.
    fn per_finger_timeout(self) -> Duration {
        match self {
            ResetKind::Arm => Duration::from_secs(10),
            ResetKind::Manual | ResetKind::Auto => Duration::from_secs(12),
            ResetKind::Hard => Duration::from_secs(18),
        }
    }
}

/// Result of one state-machine tick.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub actions: Vec<HandAction>,
    /// True when a recovery sequence finished this tick (state is Armed).
    pub finished: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Timings
// ────────────────────────────────────────────────────────────────────────────

/// Deadlines and thresholds for the reset/unjam sequences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmTimings {
    /// Overall deadline for the open-on-arm reset, seconds.
    pub arm_reset_s: f64,
    /// Overall deadline for manual/auto recovery, seconds.
    pub recovery_s: f64,
    /// Hard unjam never gets less than this overall, seconds.
    pub hard_recovery_floor_s: f64,
    /// A finger counts as open within this distance of the open pose.
    pub settle_threshold_rad: f64,
    /// Torque-release dwell on plain arm, seconds.
    pub arm_release_s: f64,
    /// Torque-release dwell on manual/auto recovery, seconds.
    pub release_s: f64,
    /// Torque-release dwell on hard unjam, seconds.
    pub hard_release_s: f64,
}

impl Default for ArmTimings {
    fn default() -> Self {
        Self {
            arm_reset_s: 8.0,
            recovery_s: 60.0,
            hard_recovery_floor_s: 90.0,
            settle_threshold_rad: 0.15,
            arm_release_s: 0.5,
            release_s: 2.5,
            hard_release_s: 4.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Machine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Torque released; waiting out the dwell before re-enabling.
    Release { until: Instant },
    /// Driving `FINGER_SEQUENCE[step]` toward the open pose.
    Opening { step: usize },
}

#[derive(Debug, Clone)]
struct Recovery {
    kind: ResetKind,
    phase: Phase,
    phase_started_at: Instant,
    deadline: Instant,
    last_error_clear: Option<Instant>,
    error_clears: u32,
}

/// The single authoritative arm lifecycle instance of a bridge process.
#[derive(Debug, Clone)]
pub struct ArmStateMachine {
    state: ArmState,
    timings: ArmTimings,
    recovery: Option<Recovery>,
}

impl ArmStateMachine {
    /// Starts `Disarmed`, always.
    pub fn new(timings: ArmTimings) -> Self {
        Self {
            state: ArmState::Disarmed,
            timings,
            recovery: None,
        }
    }

    pub fn state(&self) -> ArmState {
        self.state
    }

    pub fn timings(&self) -> &ArmTimings {
        &self.timings
    }

    /// True while a staged open sequence is running.
    pub fn reset_active(&self) -> bool {
        self.recovery.is_some()
    }

    pub fn reset_kind(&self) -> Option<ResetKind> {
        self.recovery.as_ref().map(|r| r.kind)
    }

    /// Telemetry phase number: 0 during torque release, 1–5 per finger.
    pub fn reset_phase(&self) -> u8 {
        match self.recovery.as_ref().map(|r| r.phase) {
            Some(Phase::Opening { step }) => (step + 1) as u8,
            _ => 0,
        }
    }

    /// Telemetry label for the active finger, empty otherwise.
    pub fn reset_label(&self) -> &'static str {
        match self.recovery.as_ref().map(|r| r.phase) {
            Some(Phase::Opening { step }) => PHASE_LABELS[step],
            _ => "",
        }
    }

    /// Telemetry reason string, empty when idle.
    pub fn reset_reason(&self) -> &'static str {
        self.recovery.as_ref().map_or("", |r| r.kind.reason())
    }

    // ── Operator events ────────────────────────────────────────────────────

    /// Grant or revoke motion permission.
    ///
    /// Arming from `Disarmed` enters `Resetting` and starts the open
    /// sequence.  Disarming from anywhere aborts any running sequence and
    /// drops straight to `Disarmed`; no further motion writes are issued.
    pub fn set_armed(&mut self, enabled: bool, now: Instant) -> Vec<HandAction> {
        if enabled {
            if self.state != ArmState::Disarmed {
                return Vec::new();
            }
            info!("arming: starting open reset");
            self.begin(ResetKind::Arm, now, None)
        } else {
            if self.state == ArmState::Disarmed {
                return Vec::new();
            }
            let aborted = self.recovery.take().is_some();
            self.state = ArmState::Disarmed;
            if aborted {
                info!("disarmed mid-sequence; recovery aborted");
            } else {
                info!("disarmed");
            }
            // Torque off and current limit back to normal, regardless of
            // where the sequence was.
            vec![HandAction::DisableTorque, HandAction::RestoreCurrentLimit]
        }
    }

    /// Operator `reset_open` / `hard_unjam`.  `dwell_override` stretches
    /// or shrinks the torque-release window for this run only.
    ///
    /// Ignored while `Disarmed`: the sequence needs hardware writes that
    /// the lifecycle does not permit there.
    pub fn request_recovery(
        &mut self,
        kind: ResetKind,
        now: Instant,
        dwell_override: Option<f64>,
    ) -> Vec<HandAction> {
        if !self.state.writes_allowed() {
            warn!(kind = kind.reason(), "recovery requested while disarmed; ignored");
            return Vec::new();
        }
        info!(kind = kind.reason(), "starting recovery sequence");
        self.begin(kind, now, dwell_override)
    }

    /// A nonzero joint error code was observed.  Enters auto-unjam when
    /// armed and not already in a sequence; the caller gates on its
    /// auto-unjam configuration flag.
    pub fn observe_fault(&mut self, now: Instant) -> Vec<HandAction> {
        if self.state != ArmState::Armed {
            return Vec::new();
        }
        warn!("joint fault while armed; starting auto-unjam");
        self.begin(ResetKind::Auto, now, None)
    }

    // ── Periodic drive ─────────────────────────────────────────────────────

    /// Advance the running sequence.  `actual` is the newest measured
    /// joint position (may be stale or absent), `open_target` the safe
    /// open pose the sequence is driving toward.
    pub fn tick(
        &mut self,
        now: Instant,
        actual: Option<&JointMatrix>,
        open_target: &JointMatrix,
        errors_present: bool,
    ) -> TickOutcome {
        let mut out = TickOutcome::default();
        let Some(rec) = self.recovery.as_mut() else {
            return out;
        };

        match rec.phase {
            Phase::Release { until } => {
                if now >= until {
                    rec.phase = Phase::Opening { step: 0 };
                    rec.phase_started_at = now;
                    out.actions.push(HandAction::EnableTorque);
                    out.actions.push(HandAction::ClearJointErrors);
                    debug!("torque re-enabled; opening sequence begins");
                }
                return out;
            }
            Phase::Opening { step } => {
                // Re-clear re-latching errors, throttled.
                if errors_present
                    && rec.error_clears < ERROR_CLEAR_BUDGET
                    && rec
                        .last_error_clear
                        .is_none_or(|t| now.saturating_duration_since(t) >= ERROR_CLEAR_MIN_INTERVAL)
                {
                    out.actions.push(HandAction::ClearJointErrors);
                    rec.last_error_clear = Some(now);
                    rec.error_clears += 1;
                }

                let deadline_hit = now >= rec.deadline;
                let threshold = self.timings.settle_threshold_rad;

                let mut finished = deadline_hit;
                if !finished {
                    if step < FINGER_SEQUENCE.len() - 1 {
                        let finger = FINGER_SEQUENCE[step].index();
                        let settled = actual
                            .map(|a| a.row_max_abs_diff(open_target, finger) <= threshold)
                            .unwrap_or(false);
                        // Failsafe: never park on one finger longer than its
                        // budget or the time remaining before the deadline.
                        let remaining = rec.deadline.saturating_duration_since(now);
                        let failsafe = rec
                            .kind
                            .per_finger_timeout()
                            .min(remaining.max(Duration::from_secs(2)));
                        let timed_out =
                            now.saturating_duration_since(rec.phase_started_at) >= failsafe;
                        if settled || timed_out {
                            rec.phase = Phase::Opening { step: step + 1 };
                            rec.phase_started_at = now;
                            debug!(
                                finger = PHASE_LABELS[step],
                                settled, "open sequence advanced"
                            );
                        }
                    } else {
                        // Thumb last: the whole hand must be near open.
                        finished = actual
                            .map(|a| a.max_abs_diff(open_target) <= threshold)
                            .unwrap_or(false);
                    }
                }

                if finished {
                    if deadline_hit {
                        warn!("open sequence deadline reached; treating as complete");
                    } else {
                        info!("open sequence complete");
                    }
                    out.actions.push(HandAction::RestoreCurrentLimit);
                    out.finished = true;
                    self.recovery = None;
                    self.state = ArmState::Armed;
                }
            }
        }

        out
    }

    /// Target the sequence wants this tick: the active finger goes to the
    /// open pose while every other finger holds its current position to
    /// avoid mechanical interference.  `None` while torque is released or
    /// no sequence is running.
    pub fn recovery_target(
        &self,
        open_target: &JointMatrix,
        hold: &JointMatrix,
    ) -> Option<JointMatrix> {
        let rec = self.recovery.as_ref()?;
        let Phase::Opening { step } = rec.phase else {
            return None;
        };
        let active = FINGER_SEQUENCE[step].index();
        let mut target = *hold;
        target.set_row(active, open_target.row(active));
        // Fingers already opened stay at the open pose rather than being
        // re-held against drift.
        for done in 0..step {
            let fi = FINGER_SEQUENCE[done].index();
            target.set_row(fi, open_target.row(fi));
        }
        Some(target)
    }

    fn begin(
        &mut self,
        kind: ResetKind,
        now: Instant,
        dwell_override: Option<f64>,
    ) -> Vec<HandAction> {
        let dwell_s = dwell_override.unwrap_or(match kind {
            ResetKind::Arm => self.timings.arm_release_s,
            ResetKind::Manual | ResetKind::Auto => self.timings.release_s,
            ResetKind::Hard => self.timings.hard_release_s,
        });
        let dwell_s = dwell_s.clamp(0.0, 10.0);

        let deadline_s = match kind {
            ResetKind::Arm => self.timings.arm_reset_s,
            ResetKind::Manual | ResetKind::Auto => self.timings.recovery_s,
            ResetKind::Hard => self.timings.recovery_s.max(self.timings.hard_recovery_floor_s),
        };

        self.state = if kind == ResetKind::Arm {
            ArmState::Resetting
        } else {
            ArmState::Unjamming
        };
        self.recovery = Some(Recovery {
            kind,
            phase: Phase::Release {
                until: now + Duration::from_secs_f64(dwell_s),
            },
            phase_started_at: now,
            deadline: now + Duration::from_secs_f64(deadline_s.max(dwell_s)),
            last_error_clear: None,
            error_clears: 0,
        });

        vec![
            HandAction::LowerCurrentLimit,
            HandAction::ClearJointErrors,
            HandAction::DisableTorque,
        ]
    }
}

impl Default for ArmStateMachine {
    fn default() -> Self {
        Self::new(ArmTimings::default())
    }
}
