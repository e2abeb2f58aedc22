//! Shared data model for the handbridge stack.
//!
//! Everything that crosses a crate boundary lives here: the 5×4 joint
//! matrix, per-finger extension frames, hardware limits, the arm lifecycle
//! enum, and the global error taxonomy.  The JSON wire protocol spoken to
//! tracking clients is in [`proto`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod proto;

/// Number of fingers on the hand.
pub const FINGER_COUNT: usize = 5;
/// Position-controlled joints per finger.
pub const JOINTS_PER_FINGER: usize = 4;
/// Column index of the joint reserved for lateral (spread) motion.
pub const LATERAL_JOINT: usize = 3;

// ────────────────────────────────────────────────────────────────────────────
// Fingers
// ────────────────────────────────────────────────────────────────────────────

/// The five fingers, in canonical row order of every 5×4 matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finger {
    Thumb,
    Index,
    Middle,
    Ring,
    Pinky,
}

impl Finger {
    /// All fingers in matrix row order.
    pub const ALL: [Finger; FINGER_COUNT] = [
        Finger::Thumb,
        Finger::Index,
        Finger::Middle,
        Finger::Ring,
        Finger::Pinky,
    ];

    /// Matrix row index of this finger.
    pub fn index(self) -> usize {
        self as usize
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Joint matrices
// ────────────────────────────────────────────────────────────────────────────

/// A 5×4 matrix of per-joint values in radians (one row per finger).
///
/// This is the common currency of the whole bridge: joint limits, open and
/// closed poses, desired and filtered targets, and measured positions are
/// all `JointMatrix` values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointMatrix(pub [[f64; JOINTS_PER_FINGER]; FINGER_COUNT]);

impl JointMatrix {
    /// All-zero matrix.
    pub fn zeros() -> Self {
        Self([[0.0; JOINTS_PER_FINGER]; FINGER_COUNT])
    }

    /// Matrix with every element set to `v`.
    pub fn splat(v: f64) -> Self {
        Self([[v; JOINTS_PER_FINGER]; FINGER_COUNT])
    }

    /// Element accessor.
    pub fn get(&self, finger: usize, joint: usize) -> f64 {
        self.0[finger][joint]
    }

    /// Element mutator.
    pub fn set(&mut self, finger: usize, joint: usize, v: f64) {
        self.0[finger][joint] = v;
    }

    /// One finger's row.
    pub fn row(&self, finger: usize) -> [f64; JOINTS_PER_FINGER] {
        self.0[finger]
    }

    /// Replace one finger's row.
    pub fn set_row(&mut self, finger: usize, row: [f64; JOINTS_PER_FINGER]) {
        self.0[finger] = row;
    }

    /// Apply `f` elementwise against `other`.
    pub fn zip_map(&self, other: &Self, mut f: impl FnMut(f64, f64) -> f64) -> Self {
        let mut out = *self;
        for fi in 0..FINGER_COUNT {
            for ji in 0..JOINTS_PER_FINGER {
                out.0[fi][ji] = f(self.0[fi][ji], other.0[fi][ji]);
            }
        }
        out
    }

    /// Elementwise minimum.
    pub fn elementwise_min(&self, other: &Self) -> Self {
        self.zip_map(other, f64::min)
    }

    /// Elementwise maximum.
    pub fn elementwise_max(&self, other: &Self) -> Self {
        self.zip_map(other, f64::max)
    }

    /// Clamp every element into `[floor, ceil]` elementwise.
    pub fn clamp(&self, floor: &Self, ceil: &Self) -> Self {
        let mut out = *self;
        for fi in 0..FINGER_COUNT {
            for ji in 0..JOINTS_PER_FINGER {
                out.0[fi][ji] = self.0[fi][ji].clamp(floor.0[fi][ji], ceil.0[fi][ji]);
            }
        }
        out
    }

    /// Largest absolute elementwise difference against `other`.
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        let mut worst = 0.0f64;
        for fi in 0..FINGER_COUNT {
            for ji in 0..JOINTS_PER_FINGER {
                worst = worst.max((self.0[fi][ji] - other.0[fi][ji]).abs());
            }
        }
        worst
    }

    /// Largest absolute difference on a single finger's row.
    pub fn row_max_abs_diff(&self, other: &Self, finger: usize) -> f64 {
        let mut worst = 0.0f64;
        for ji in 0..JOINTS_PER_FINGER {
            worst = worst.max((self.0[finger][ji] - other.0[finger][ji]).abs());
        }
        worst
    }
}

/// Per-joint error codes as reported by the hardware (0 = no fault).
pub type JointErrorCodes = [[u16; JOINTS_PER_FINGER]; FINGER_COUNT];

/// True when any joint reports a nonzero error code.
pub fn any_joint_error(codes: &JointErrorCodes) -> bool {
    codes.iter().any(|row| row.iter().any(|&c| c != 0))
}

// ────────────────────────────────────────────────────────────────────────────
// Hardware limits & device identity
// ────────────────────────────────────────────────────────────────────────────

/// Joint angle limits as read from the hardware at connect time.
///
/// Individual joints may report `lower > upper` (inverted axes), so code
/// that needs a true bound must use [`floor`][Self::floor] /
/// [`ceil`][Self::ceil] rather than the raw rows.  Replaced wholesale on
/// every reconnect, never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub lower: JointMatrix,
    pub upper: JointMatrix,
}

impl JointLimits {
    /// Elementwise minimum of the two limit rows.
    pub fn floor(&self) -> JointMatrix {
        self.lower.elementwise_min(&self.upper)
    }

    /// Elementwise maximum of the two limit rows.
    pub fn ceil(&self) -> JointMatrix {
        self.lower.elementwise_max(&self.upper)
    }

    /// True when every element of `m` lies within the limits.
    pub fn contains(&self, m: &JointMatrix) -> bool {
        let floor = self.floor();
        let ceil = self.ceil();
        for fi in 0..FINGER_COUNT {
            for ji in 0..JOINTS_PER_FINGER {
                let v = m.get(fi, ji);
                if v < floor.get(fi, ji) - 1e-9 || v > ceil.get(fi, ji) + 1e-9 {
                    return false;
                }
            }
        }
        true
    }
}

/// One-time identity read from the hardware at connect time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: Option<String>,
    pub firmware_version: Option<String>,
    pub handedness: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Tracking input
// ────────────────────────────────────────────────────────────────────────────

/// Which tracked hand (or manual slider input) produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandSide {
    Left,
    Right,
    Manual,
}

/// One pose sample from a tracking client.
///
/// `extensions` is in [`Finger::ALL`] order, nominally 0–100 per finger
/// (100 = fully open).  Values outside that range are tolerated here and
/// clamped by the mapping engine.  At most one frame is "current" at a
/// time; a newer frame always replaces an older one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtensionFrame {
    pub side: HandSide,
    pub extensions: [f64; FINGER_COUNT],
    /// Thumb spread (lateral DOF), 0–100, when the client tracks it.
    pub spread: Option<f64>,
}

impl ExtensionFrame {
    /// Extension value for one finger.
    pub fn extension(&self, finger: Finger) -> f64 {
        self.extensions[finger.index()]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Arm lifecycle
// ────────────────────────────────────────────────────────────────────────────

/// Operator-gated motion permission state.  One authoritative instance per
/// bridge process; every process starts `Disarmed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmState {
    #[default]
    Disarmed,
    Resetting,
    Armed,
    Unjamming,
}

impl ArmState {
    /// Hardware writes are permitted only in these states.
    pub fn writes_allowed(self) -> bool {
        !matches!(self, ArmState::Disarmed)
    }

    /// True while a staged open/recovery sequence is driving the hand.
    pub fn in_recovery(self) -> bool {
        matches!(self, ArmState::Resetting | ArmState::Unjamming)
    }
}

impl std::fmt::Display for ArmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArmState::Disarmed => "disarmed",
            ArmState::Resetting => "resetting",
            ArmState::Armed => "armed",
            ArmState::Unjamming => "unjamming",
        };
        write!(f, "{s}")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error taxonomy.  Every variant maps to a recovery rule; none of
/// them is allowed to take the process down.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Device absent or unreachable; recovered by backoff retry.
    #[error("hardware connection failed: {0}")]
    Connection(String),

    /// Transport driver mismatch; needs external action, bridge keeps retrying.
    #[error("incompatible transport driver: {0}")]
    DriverIncompatible(String),

    /// A joint target write failed; discarded, next tick supersedes it.
    #[error("joint write failed: {0}")]
    Write(String),

    /// A joint target write exceeded its deadline.
    #[error("joint write timed out after {0:.1}s")]
    WriteTimeout(f64),

    /// Hardware reported a nonzero per-joint error code.
    #[error("joint fault on {finger} joint {joint}: code {code}")]
    Joint {
        finger: &'static str,
        joint: usize,
        code: u16,
    },

    /// Malformed client message; dropped, connection unaffected.
    #[error("malformed client message: {0}")]
    Protocol(String),

    /// Bad mapping/config file; defaults are used instead.
    #[error("bad configuration: {0}")]
    Config(String),

    /// Internal channel closed (shutdown path only).
    #[error("channel closed: {0}")]
    Channel(String),
}
