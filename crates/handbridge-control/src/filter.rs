//! Safety filter: exponential smoothing plus per-joint rate limiting,
//! applied to every target before it can reach hardware.
//!
//! The filter is stateful (`prev` carries tick to tick) and must be
//! re-seeded with the hand's actual position whenever control resumes
//! after a period of not writing, otherwise the first tick would command
//! a discontinuous jump.

use handbridge_types::{JointLimits, JointMatrix};

/// Ticks arriving later than this are treated as this long, so a stalled
/// scheduler cannot translate into one giant permitted step.
const MAX_DT_S: f64 = 0.2;

/// Per-mode filter tuning.  Recovery states run with a much lower speed
/// cap than normal tracking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    /// Maximum per-joint target speed in rad/s.  0 disables rate limiting.
    pub max_speed_rad_s: f64,
    /// Smoothing coefficient: `s = alpha·desired + (1−alpha)·prev`.
    pub smoothing_alpha: f64,
}

/// Stateful two-stage filter.  Owns the one and only filtered target.
#[derive(Debug, Clone, Default)]
pub struct SafetyFilter {
    prev: Option<JointMatrix>,
}

impl SafetyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the filter at `pose` so the next tick steps from there.
    pub fn reset_to(&mut self, pose: JointMatrix) {
        self.prev = Some(pose);
    }

    /// Forget the carried state (used when writes stop entirely).
    pub fn clear(&mut self) {
        self.prev = None;
    }

    /// The last filtered target, if control is active.
    pub fn last(&self) -> Option<&JointMatrix> {
        self.prev.as_ref()
    }

    /// Run one tick: clamp into limits, smooth, rate-limit, carry state.
    pub fn apply(
        &mut self,
        desired: &JointMatrix,
        dt_s: f64,
        params: &FilterParams,
        limits: &JointLimits,
    ) -> JointMatrix {
        let floor = limits.floor();
        let ceil = limits.ceil();
        let desired = desired.clamp(&floor, &ceil);

        let Some(prev) = self.prev else {
            // First write after a reseed-less resume: no previous target to
            // step from, so the clamped desired passes through.
            self.prev = Some(desired);
            return desired;
        };

        let alpha = params.smoothing_alpha.clamp(0.0, 1.0);
        let smoothed = desired.zip_map(&prev, |d, p| alpha * d + (1.0 - alpha) * p);

        let dt = dt_s.clamp(0.0, MAX_DT_S);
        let out = if params.max_speed_rad_s > 0.0 && dt > 0.0 {
            let max_step = params.max_speed_rad_s * dt;
            smoothed.zip_map(&prev, |s, p| p + (s - p).clamp(-max_step, max_step))
        } else {
            smoothed
        };

        let out = out.clamp(&floor, &ceil);
        self.prev = Some(out);
        out
    }
}
