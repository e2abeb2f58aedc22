//! In-process hand simulator for `--dry-run` and headless tests.
//!
//! [`SimHand`] implements the full [`HandDriver`] surface against plausible
//! state: joints track their targets instantly while torque is enabled,
//! limits default to a realistic calibration matrix, and tests can inject
//! joint faults or write failures.  Clones share state, so a test can keep
//! a handle while the connector owns the boxed driver.

use std::sync::{Arc, Mutex};

use handbridge_types::{
    BridgeError, DeviceInfo, JointErrorCodes, JointLimits, JointMatrix, FINGER_COUNT,
    JOINTS_PER_FINGER,
};

use crate::driver::HandDriver;

/// Default current limit the simulator starts with, mirroring hardware docs.
const DEFAULT_CURRENT_LIMIT_MA: u32 = 1000;

#[derive(Debug)]
struct SimInner {
    limits: JointLimits,
    position: JointMatrix,
    target: JointMatrix,
    torque_enabled: bool,
    current_limit_ma: u32,
    error_codes: JointErrorCodes,
    input_voltage: f64,
    fail_writes: bool,
    target_writes: u64,
    info: DeviceInfo,
}

/// Simulated hand.  Cheap to clone; all clones share one device state.
#[derive(Debug, Clone)]
pub struct SimHand {
    inner: Arc<Mutex<SimInner>>,
}

impl SimHand {
    /// Simulator with the default calibration matrix (lower limits at zero,
    /// upper limits per finger, lateral joints immobile).
    pub fn new() -> Self {
        let limits = Self::default_limits();
        let rest = limits.lower;
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                limits,
                position: rest,
                target: rest,
                torque_enabled: false,
                current_limit_ma: DEFAULT_CURRENT_LIMIT_MA,
                error_codes: [[0; JOINTS_PER_FINGER]; FINGER_COUNT],
                input_voltage: 12.0,
                fail_writes: false,
                target_writes: 0,
                info: DeviceInfo {
                    serial: Some("SIM-0001".to_string()),
                    firmware_version: Some("sim-1.0".to_string()),
                    handedness: Some("right".to_string()),
                },
            })),
        }
    }

    /// The calibration matrix used when none is supplied.
    pub fn default_limits() -> JointLimits {
        JointLimits {
            lower: JointMatrix::zeros(),
            upper: JointMatrix([
                [1.2, 1.0, 0.8, 0.0], // thumb
                [1.1, 1.2, 1.0, 0.0], // index
                [1.1, 1.2, 1.0, 0.0], // middle
                [1.1, 1.2, 1.0, 0.0], // ring
                [1.1, 1.2, 1.0, 0.0], // pinky
            ]),
        }
    }

    /// Replace the simulated joint limits (test hook).
    pub fn set_limits(&self, limits: JointLimits) {
        let mut s = self.lock();
        s.limits = limits;
    }

    /// Teleport the simulated hand (test hook, e.g. for `auto` pose checks).
    pub fn set_position(&self, position: JointMatrix) {
        self.lock().position = position;
    }

    /// Current simulated joint positions.
    pub fn position(&self) -> JointMatrix {
        self.lock().position
    }

    /// Most recently commanded target.
    pub fn target(&self) -> JointMatrix {
        self.lock().target
    }

    /// Number of accepted target writes so far.
    pub fn target_writes(&self) -> u64 {
        self.lock().target_writes
    }

    /// Whether joint torque is currently enabled.
    pub fn torque_enabled(&self) -> bool {
        self.lock().torque_enabled
    }

    /// Current limit last written by the bridge.
    pub fn current_limit_ma(&self) -> u32 {
        self.lock().current_limit_ma
    }

    /// Latch a fault code on one joint; cleared by `write_joint_reset_error`.
    pub fn inject_joint_error(&self, finger: usize, joint: usize, code: u16) {
        self.lock().error_codes[finger][joint] = code;
    }

    /// Make every subsequent write fail with [`BridgeError::Write`].
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Simulated supply voltage (test hook).
    pub fn set_input_voltage(&self, volts: f64) {
        self.lock().input_voltage = volts;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        // Poisoning only happens if a test panicked while holding the lock;
        // recovering the inner state is always safe for a simulator.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SimHand {
    fn default() -> Self {
        Self::new()
    }
}

impl HandDriver for SimHand {
    fn device_info(&mut self) -> DeviceInfo {
        self.lock().info.clone()
    }

    fn read_joint_lower_limit(&mut self) -> Result<JointMatrix, BridgeError> {
        Ok(self.lock().limits.lower)
    }

    fn read_joint_upper_limit(&mut self) -> Result<JointMatrix, BridgeError> {
        Ok(self.lock().limits.upper)
    }

    fn read_joint_actual_position(&mut self) -> Result<JointMatrix, BridgeError> {
        Ok(self.lock().position)
    }

    fn read_joint_error_code(&mut self) -> Result<JointErrorCodes, BridgeError> {
        Ok(self.lock().error_codes)
    }

    fn read_input_voltage(&mut self) -> Result<f64, BridgeError> {
        Ok(self.lock().input_voltage)
    }

    fn write_joint_target_position(&mut self, target: &JointMatrix) -> Result<(), BridgeError> {
        let mut s = self.lock();
        if s.fail_writes {
            return Err(BridgeError::Write("simulated write failure".to_string()));
        }
        let clamped = target.clamp(&s.limits.floor(), &s.limits.ceil());
        s.target = clamped;
        s.target_writes += 1;
        if s.torque_enabled {
            s.position = clamped;
        }
        Ok(())
    }

    fn write_joint_enabled(&mut self, enabled: bool) -> Result<(), BridgeError> {
        let mut s = self.lock();
        if s.fail_writes {
            return Err(BridgeError::Write("simulated write failure".to_string()));
        }
        s.torque_enabled = enabled;
        Ok(())
    }

    fn write_joint_current_limit(&mut self, limit_ma: u32) -> Result<(), BridgeError> {
        let mut s = self.lock();
        if s.fail_writes {
            return Err(BridgeError::Write("simulated write failure".to_string()));
        }
        s.current_limit_ma = limit_ma;
        Ok(())
    }

    fn write_joint_reset_error(&mut self) -> Result<(), BridgeError> {
        let mut s = self.lock();
        if s.fail_writes {
            return Err(BridgeError::Write("simulated write failure".to_string()));
        }
        s.error_codes = [[0; JOINTS_PER_FINGER]; FINGER_COUNT];
        Ok(())
    }
}
