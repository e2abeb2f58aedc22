//! Calibration store: the mapping configuration file and the derivation of
//! open/closed reference poses from hardware joint limits.
//!
//! The mapping file is TOML and entirely optional; a malformed or missing
//! file falls back to the compiled-in defaults and never blocks startup.
//!
//! ```toml
//! open_pose = "upper"
//! closed_pose = "lower"
//! max_curl = 0.85
//! open_margin = 0.10
//!
//! [finger_weights]
//! thumb = [1.00, 0.90, 0.60, 0.00]
//! index = [0.70, 1.00, 0.80, 0.00]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use handbridge_types::{BridgeError, JointLimits, JointMatrix, FINGER_COUNT, JOINTS_PER_FINGER};

/// Weights mapping one curl scalar onto the four joints of a non-thumb
/// finger.  The lateral joint stays at zero until its mechanism is mapped.
pub const DEFAULT_FINGER_WEIGHTS: [f64; JOINTS_PER_FINGER] = [0.70, 1.00, 0.80, 0.00];
/// Thumb weighting differs: the base joint carries most of the curl.
pub const DEFAULT_THUMB_WEIGHTS: [f64; JOINTS_PER_FINGER] = [1.00, 0.90, 0.60, 0.00];

/// How an open or closed reference pose is chosen from the joint limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseMode {
    Lower,
    Upper,
    /// Infer from the actual joint position read at connect time: the
    /// closer limit becomes the open side.  Assumes the hand rests open;
    /// a hand connected mid-grip inverts the mapping, so the derivation
    /// logs a warning for the operator to confirm before first arm.
    Auto,
}

/// Per-finger weight rows as written in the mapping file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    #[serde(default = "default_thumb_row")]
    pub thumb: [f64; JOINTS_PER_FINGER],
    #[serde(default = "default_finger_row")]
    pub index: [f64; JOINTS_PER_FINGER],
    #[serde(default = "default_finger_row")]
    pub middle: [f64; JOINTS_PER_FINGER],
    #[serde(default = "default_finger_row")]
    pub ring: [f64; JOINTS_PER_FINGER],
    #[serde(default = "default_finger_row")]
    pub pinky: [f64; JOINTS_PER_FINGER],
}

fn default_thumb_row() -> [f64; JOINTS_PER_FINGER] {
    DEFAULT_THUMB_WEIGHTS
}
fn default_finger_row() -> [f64; JOINTS_PER_FINGER] {
    DEFAULT_FINGER_WEIGHTS
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            thumb: DEFAULT_THUMB_WEIGHTS,
            index: DEFAULT_FINGER_WEIGHTS,
            middle: DEFAULT_FINGER_WEIGHTS,
            ring: DEFAULT_FINGER_WEIGHTS,
            pinky: DEFAULT_FINGER_WEIGHTS,
        }
    }
}

impl WeightTable {
    /// Rows in canonical matrix order, each weight clamped into [0, 1].
    pub fn to_matrix(&self) -> JointMatrix {
        let rows = [self.thumb, self.index, self.middle, self.ring, self.pinky];
        let mut m = JointMatrix::zeros();
        for (fi, row) in rows.iter().enumerate() {
            for (ji, w) in row.iter().enumerate() {
                m.set(fi, ji, w.clamp(0.0, 1.0));
            }
        }
        m
    }
}

/// Mapping configuration, immutable for the process lifetime once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Which limit is "open".  This hand boots into a stable open pose at
    /// its upper limits, hence the default; inverted devices override it.
    #[serde(default = "default_open_mode", rename = "open_pose")]
    pub open_pose_mode: PoseMode,
    #[serde(default = "default_closed_mode", rename = "closed_pose")]
    pub closed_pose_mode: PoseMode,
    /// How closed the hand may get (0 = open, 1 = full fist).  Kept below
    /// 1.0 because a perfect fist can jam some hardware batches.
    #[serde(default = "default_max_curl")]
    pub max_curl: f64,
    /// Open targets sit this fraction of the way toward closed so the
    /// joints are not driven into their hard stops.
    #[serde(default = "default_open_margin")]
    pub open_margin: f64,
    #[serde(default)]
    pub finger_weights: WeightTable,
}

fn default_open_mode() -> PoseMode {
    PoseMode::Upper
}
fn default_closed_mode() -> PoseMode {
    PoseMode::Lower
}
fn default_max_curl() -> f64 {
    0.85
}
fn default_open_margin() -> f64 {
    0.10
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            open_pose_mode: default_open_mode(),
            closed_pose_mode: default_closed_mode(),
            max_curl: default_max_curl(),
            open_margin: default_open_margin(),
            finger_weights: WeightTable::default(),
        }
    }
}

impl MappingConfig {
    /// Parse a mapping file.
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

    /// Load `path` if given, falling back to the defaults on any failure.
    /// Startup is never blocked by a bad mapping file.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            None => Self::default(),
            Some(p) => match Self::load(p) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(error = %e, "mapping config rejected, using defaults");
                    Self::default()
                }
            },
        }
    }

    /// Clamp file-supplied safety limits into their valid ranges.
    fn sanitize(&mut self) {
        if !self.max_curl.is_finite() {
            self.max_curl = default_max_curl();
        }
        self.max_curl = self.max_curl.clamp(0.0, 1.0);
        if !self.open_margin.is_finite() || !(0.0..=0.5).contains(&self.open_margin) {
            self.open_margin = default_open_margin();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose derivation
// ────────────────────────────────────────────────────────────────────────────

/// Derive the open and closed reference poses from hardware limits.
///
/// `actual` is the joint position read at connect time and is only used by
/// [`PoseMode::Auto`]; without it `auto` degrades to `lower` for the open
/// side.
pub fn derive_open_closed(
    limits: &JointLimits,
    actual: Option<&JointMatrix>,
    cfg: &MappingConfig,
) -> (JointMatrix, JointMatrix) {
    let lower = limits.lower;
    let upper = limits.upper;

    // Per joint: is the lower limit the open side?
    let mut open_is_lower = [[true; JOINTS_PER_FINGER]; FINGER_COUNT];
    match cfg.open_pose_mode {
        PoseMode::Lower => {}
        PoseMode::Upper => {
            open_is_lower = [[false; JOINTS_PER_FINGER]; FINGER_COUNT];
        }
        PoseMode::Auto => match actual {
            Some(act) => {
                for fi in 0..FINGER_COUNT {
                    for ji in 0..JOINTS_PER_FINGER {
                        let a = act.get(fi, ji);
                        open_is_lower[fi][ji] =
                            (a - lower.get(fi, ji)).abs() <= (a - upper.get(fi, ji)).abs();
                    }
                }
                warn!(
                    "open pose inferred from rest position; confirm the hand was open before arming"
                );
            }
            None => {
                warn!("auto open-pose requested without a rest position read; assuming lower");
            }
        },
    }

    let mut open = JointMatrix::zeros();
    for fi in 0..FINGER_COUNT {
        for ji in 0..JOINTS_PER_FINGER {
            open.set(
                fi,
                ji,
                if open_is_lower[fi][ji] {
                    lower.get(fi, ji)
                } else {
                    upper.get(fi, ji)
                },
            );
        }
    }

    let mut closed = JointMatrix::zeros();
    for fi in 0..FINGER_COUNT {
        for ji in 0..JOINTS_PER_FINGER {
            let v = match cfg.closed_pose_mode {
                PoseMode::Lower => lower.get(fi, ji),
                PoseMode::Upper => upper.get(fi, ji),
                // Closed is the opposite limit from open, per joint.
                PoseMode::Auto => {
                    if open_is_lower[fi][ji] {
                        upper.get(fi, ji)
                    } else {
                        lower.get(fi, ji)
                    }
                }
            };
            closed.set(fi, ji, v);
        }
    }

    (open, closed)
}

/// An open target `margin` of the way toward closed, clamped into limits.
/// Keeps the release pose off the hard stops; recovery paths widen the
/// margin when joints are faulting.
pub fn safe_open_pose(
    open: &JointMatrix,
    closed: &JointMatrix,
    limits: &JointLimits,
    margin: f64,
) -> JointMatrix {
    let m = if (0.0..=0.5).contains(&margin) { margin } else { 0.1 };
    open.zip_map(closed, |o, c| o + m * (c - o))
        .clamp(&limits.floor(), &limits.ceil())
}
