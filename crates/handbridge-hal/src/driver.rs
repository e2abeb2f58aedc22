//! The fixed primitive interface to the hand hardware.
//!
//! Transports implement [`HandDriver`] and are handed to the
//! [`HandConnector`][crate::connector::HandConnector] through a factory
//! closure.  The rest of the bridge only ever talks to the trait, so the
//! vendor SDK can be swapped (or replaced by [`SimHand`][crate::sim::SimHand])
//! without touching control logic.

use handbridge_types::{BridgeError, DeviceInfo, JointErrorCodes, JointMatrix};

/// USB identity used to pick a device when several are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    pub usb_vid: u16,
    /// `None` matches any product id.
    pub usb_pid: Option<u16>,
    pub serial: Option<String>,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self {
            usb_vid: 0x0483,
            usb_pid: None,
            serial: None,
        }
    }
}

/// Primitive reads and writes against one connected hand.
///
/// Every method may touch the transport, so all of them take `&mut self`.
/// Implementations must return promptly: the connector treats a slow write
/// as [`BridgeError::WriteTimeout`] and the control tick never waits on one.
///
/// # Errors
///
/// [`BridgeError::Connection`] signals a dead transport and makes the
/// connector drop the driver and re-enter backoff; any other variant is
/// recorded and retried implicitly by the next tick.
pub trait HandDriver: Send + std::fmt::Debug {
    /// One-time identity (serial, firmware, handedness) read at connect.
    fn device_info(&mut self) -> DeviceInfo;

    fn read_joint_lower_limit(&mut self) -> Result<JointMatrix, BridgeError>;
    fn read_joint_upper_limit(&mut self) -> Result<JointMatrix, BridgeError>;
    fn read_joint_actual_position(&mut self) -> Result<JointMatrix, BridgeError>;
    fn read_joint_error_code(&mut self) -> Result<JointErrorCodes, BridgeError>;
    fn read_input_voltage(&mut self) -> Result<f64, BridgeError>;

    /// Command all 20 joints to the given target angles.
    fn write_joint_target_position(&mut self, target: &JointMatrix) -> Result<(), BridgeError>;

    /// Enable or release joint torque.
    fn write_joint_enabled(&mut self, enabled: bool) -> Result<(), BridgeError>;

    /// Per-joint current limit in milliamps.
    fn write_joint_current_limit(&mut self, limit_ma: u32) -> Result<(), BridgeError>;

    /// Clear latched per-joint error codes.
    fn write_joint_reset_error(&mut self) -> Result<(), BridgeError>;
}
