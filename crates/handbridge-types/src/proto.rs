//! JSON wire protocol spoken over the persistent WebSocket connection.
//!
//! All messages are single JSON objects tagged on `type`.  Parsing is
//! per-message: a payload that fails to deserialize is dropped and the
//! connection stays up.
//!
//! | Direction | Types |
//! |---|---|
//! | client → bridge | `hello`, `arm`, `hand_data`, `reset_open`, `hard_unjam`, `connect` |
//! | bridge → client | `status`, `telemetry` |

use serde::{Deserialize, Serialize};

use crate::{
    ArmState, ExtensionFrame, Finger, HandSide, JointErrorCodes, JointMatrix, FINGER_COUNT,
};

// ────────────────────────────────────────────────────────────────────────────
// Client → bridge
// ────────────────────────────────────────────────────────────────────────────

/// Per-finger extension values as they appear on the wire.
///
/// Missing fingers default to 0.0 (fully curled request), matching the
/// tracking clients that omit fingers they lost sight of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Extensions {
    #[serde(default)]
    pub thumb: f64,
    #[serde(default)]
    pub index: f64,
    #[serde(default)]
    pub middle: f64,
    #[serde(default)]
    pub ring: f64,
    #[serde(default)]
    pub pinky: f64,
}

impl Extensions {
    /// Convert into [`Finger::ALL`] row order.
    pub fn to_array(self) -> [f64; FINGER_COUNT] {
        [self.thumb, self.index, self.middle, self.ring, self.pinky]
    }

    /// Build from row order (test helper and manual control paths).
    pub fn from_array(a: [f64; FINGER_COUNT]) -> Self {
        Self {
            thumb: a[Finger::Thumb.index()],
            index: a[Finger::Index.index()],
            middle: a[Finger::Middle.index()],
            ring: a[Finger::Ring.index()],
            pinky: a[Finger::Pinky.index()],
        }
    }
}

/// Messages accepted from tracking/observer clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake; answered with exactly one `status`.
    Hello,
    /// Grant or revoke motion permission.
    Arm { enabled: bool },
    /// One tracked pose sample.
    HandData {
        side: HandSide,
        extensions: Extensions,
        /// Thumb spread (lateral DOF), 0–100, when tracked.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spread: Option<f64>,
    },
    /// Request the staged open/recovery sequence.
    ResetOpen,
    /// Aggressive recovery: lower current, longer torque release.
    HardUnjam {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_ma: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        disable_s: Option<f64>,
    },
    /// Force an immediate hardware reconnect attempt.
    Connect,
}

impl ClientMessage {
    /// Extract the pose frame from a `hand_data` message.
    pub fn as_frame(&self) -> Option<ExtensionFrame> {
        match self {
            ClientMessage::HandData {
                side,
                extensions,
                spread,
            } => Some(ExtensionFrame {
                side: *side,
                extensions: extensions.to_array(),
                spread: *spread,
            }),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bridge → client
// ────────────────────────────────────────────────────────────────────────────

/// Connection + lifecycle snapshot, sent on handshake and on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub has_hardware: bool,
    pub armed: bool,
    pub arm_state: ArmState,
    pub last_hw_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handedness: Option<String>,
}

/// Telemetry broadcast at the telemetry cadence.
///
/// Hardware-sourced fields are `None` while disconnected; the recovery
/// fields let observers render staged-open progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Wall-clock milliseconds since the Unix epoch.
    pub ts: i64,
    pub input_voltage: Option<f64>,
    pub joint_actual_position: Option<JointMatrix>,
    pub joint_error_code: Option<JointErrorCodes>,
    /// Accepted frame rate over the trailing second.
    pub cmd_hz: f64,
    /// Age of the newest accepted frame, milliseconds.
    pub cmd_age_ms: Option<i64>,
    pub reset_active: bool,
    pub reset_phase: u8,
    pub reset_label: String,
    pub reset_reason: String,
}

/// Messages pushed to every observing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status(StatusReport),
    Telemetry(TelemetrySample),
}
