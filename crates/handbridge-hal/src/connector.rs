//! [`HandConnector`] – owns the active driver, reconnect backoff, and the
//! non-fatal write policy.
//!
//! The connector is the single writer of connection status and joint
//! limits.  Connect attempts are rate-limited by exponential backoff
//! (`3.0 × 1.5^(N−1)` seconds, capped at 30 s); an operator `connect`
//! request bypasses the wait.  A failed joint write is logged and
//! superseded by the next tick's write, never retried synchronously; only
//! connection-class failures drop the driver back into the backoff loop.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use handbridge_types::{BridgeError, DeviceInfo, JointErrorCodes, JointLimits, JointMatrix};

use crate::driver::{DeviceSelector, HandDriver};

/// First retry delay after a connect failure, seconds.
pub const BACKOFF_BASE_S: f64 = 3.0;
/// Multiplier applied per consecutive failure.
pub const BACKOFF_GROWTH: f64 = 1.5;
/// Upper bound on the retry delay, seconds.
pub const BACKOFF_CAP_S: f64 = 30.0;

/// Retry delay after `consecutive_failures` failed attempts since the last
/// success: `min(3.0 × 1.5^(N−1), 30.0)` seconds.
pub fn retry_delay(consecutive_failures: u32) -> Duration {
    let n = consecutive_failures.max(1);
    let secs = (BACKOFF_BASE_S * BACKOFF_GROWTH.powi(n as i32 - 1)).min(BACKOFF_CAP_S);
    Duration::from_secs_f64(secs)
}

/// Opens a transport for the selected device.  Called on every attempt.
pub type DriverFactory =
    Box<dyn FnMut(&DeviceSelector) -> Result<Box<dyn HandDriver>, BridgeError> + Send>;

/// One telemetry poll's worth of hardware state.
#[derive(Debug, Clone, Copy)]
pub struct HardwareReadout {
    pub input_voltage: f64,
    pub position: JointMatrix,
    pub error_codes: JointErrorCodes,
}

/// Connection owner.  See the module docs for the retry/write policy.
pub struct HandConnector {
    selector: DeviceSelector,
    factory: DriverFactory,
    driver: Option<Box<dyn HandDriver>>,
    limits: Option<JointLimits>,
    device_info: Option<DeviceInfo>,
    /// Actual position captured at connect time, for `auto` pose inference.
    initial_position: Option<JointMatrix>,
    last_error: Option<String>,
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
}

impl HandConnector {
    pub fn new(selector: DeviceSelector, factory: DriverFactory) -> Self {
        Self {
            selector,
            factory,
            driver: None,
            limits: None,
            device_info: None,
            initial_position: None,
            last_error: None,
            consecutive_failures: 0,
            next_attempt_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_some()
    }

    /// Joint limits read at the last successful connect.  Kept after a
    /// disconnect so observers still see a calibration, replaced wholesale
    /// on reconnect.
    pub fn limits(&self) -> Option<&JointLimits> {
        self.limits.as_ref()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// Actual joint position captured at connect time.
    pub fn initial_position(&self) -> Option<&JointMatrix> {
        self.initial_position.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record an error that should surface in the status broadcast even
    /// though it did not originate inside the connector.
    pub fn record_error(&mut self, msg: impl Into<String>) {
        self.last_error = Some(msg.into());
    }

    /// Consecutive failed connect attempts since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the next automatic attempt is allowed, if backing off.
    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    /// Try to connect.  Honors the backoff window unless `force` is set.
    /// Returns `true` when a new connection was established.
    pub fn maybe_connect(&mut self, now: Instant, force: bool) -> bool {
        if self.driver.is_some() {
            return false;
        }
        if !force {
            if let Some(at) = self.next_attempt_at {
                if now < at {
                    return false;
                }
            }
        }

        let mut driver = match (self.factory)(&self.selector) {
            Ok(d) => d,
            Err(e) => {
                self.note_connect_failure(now, e);
                return false;
            }
        };

        // Calibration reads are part of the connect handshake; a failure
        // here counts as a failed attempt.
        let limits = driver
            .read_joint_lower_limit()
            .and_then(|lower| driver.read_joint_upper_limit().map(|upper| JointLimits { lower, upper }));
        let limits = match limits {
            Ok(l) => l,
            Err(e) => {
                self.note_connect_failure(now, e);
                return false;
            }
        };

        let info = driver.device_info();
        // Best-effort: an unreadable rest pose only degrades `auto` pose
        // inference, it does not fail the connect.
        let initial = driver.read_joint_actual_position().ok();

        info!(
            serial = info.serial.as_deref().unwrap_or("-"),
            firmware = info.firmware_version.as_deref().unwrap_or("-"),
            "hand connected"
        );

        self.driver = Some(driver);
        self.limits = Some(limits);
        self.device_info = Some(info);
        self.initial_position = initial;
        self.last_error = None;
        self.consecutive_failures = 0;
        self.next_attempt_at = None;
        true
    }

    /// Drop the driver and surface `reason`; the backoff loop reconnects.
    pub fn mark_disconnected(&mut self, reason: impl Into<String>) {
        if self.driver.take().is_some() {
            let reason = reason.into();
            warn!(%reason, "hand disconnected");
            self.last_error = Some(reason);
        }
    }

    /// Non-blocking joint target write.  Returns `true` on success; a
    /// failure is logged and left to be superseded by the next tick.
    pub fn write_target(&mut self, target: &JointMatrix) -> bool {
        let Some(driver) = self.driver.as_mut() else {
            return false;
        };
        let res = driver.write_joint_target_position(target);
        self.settle_write("joint target", res)
    }

    /// Enable or release joint torque.
    pub fn set_torque(&mut self, enabled: bool) -> bool {
        let Some(driver) = self.driver.as_mut() else {
            return false;
        };
        let res = driver.write_joint_enabled(enabled);
        self.settle_write("joint enable", res)
    }

    /// Write the per-joint current limit in milliamps.
    pub fn set_current_limit(&mut self, limit_ma: u32) -> bool {
        let Some(driver) = self.driver.as_mut() else {
            return false;
        };
        let res = driver.write_joint_current_limit(limit_ma);
        self.settle_write("current limit", res)
    }

    /// Clear latched joint error codes.
    pub fn clear_joint_errors(&mut self) -> bool {
        let Some(driver) = self.driver.as_mut() else {
            return false;
        };
        let res = driver.write_joint_reset_error();
        self.settle_write("error reset", res)
    }

    /// Read the actual joint position (used to re-seed the safety filter).
    pub fn read_actual_position(&mut self) -> Option<JointMatrix> {
        let driver = self.driver.as_mut()?;
        match driver.read_joint_actual_position() {
            Ok(p) => Some(p),
            Err(e) => {
                self.settle_read("actual position", e);
                None
            }
        }
    }

    /// One telemetry poll: voltage + positions + error codes.
    pub fn read_telemetry(&mut self) -> Option<HardwareReadout> {
        let driver = self.driver.as_mut()?;
        let res = (|| {
            Ok::<_, BridgeError>(HardwareReadout {
                input_voltage: driver.read_input_voltage()?,
                position: driver.read_joint_actual_position()?,
                error_codes: driver.read_joint_error_code()?,
            })
        })();
        match res {
            Ok(r) => Some(r),
            Err(e) => {
                self.settle_read("telemetry", e);
                None
            }
        }
    }

    fn note_connect_failure(&mut self, now: Instant, e: BridgeError) {
        self.consecutive_failures += 1;
        let delay = retry_delay(self.consecutive_failures);
        self.next_attempt_at = Some(now + delay);
        self.last_error = Some(e.to_string());
        warn!(
            attempt = self.consecutive_failures,
            retry_in_s = delay.as_secs_f64(),
            error = %e,
            "hand connect failed"
        );
    }

    fn settle_write(&mut self, what: &str, res: Result<(), BridgeError>) -> bool {
        match res {
            Ok(()) => true,
            Err(BridgeError::Connection(msg)) => {
                self.mark_disconnected(format!("{what} write: {msg}"));
                false
            }
            Err(e) => {
                warn!(op = what, error = %e, "hardware write failed");
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn settle_read(&mut self, what: &str, e: BridgeError) {
        match e {
            BridgeError::Connection(msg) => {
                self.mark_disconnected(format!("{what} read: {msg}"));
            }
            e => {
                warn!(op = what, error = %e, "hardware read failed");
                self.last_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHand;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing_factory(attempts: Arc<AtomicU32>) -> DriverFactory {
        Box::new(move |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BridgeError::Connection("no device".to_string()))
        })
    }

    fn sim_factory(sim: SimHand) -> DriverFactory {
        Box::new(move |_| Ok(Box::new(sim.clone()) as Box<dyn HandDriver>))
    }

    #[test]
    fn retry_delay_follows_documented_curve() {
        let expect = |n: u32| (3.0f64 * 1.5f64.powi(n as i32 - 1)).min(30.0);
        for n in 1..=10 {
            let d = retry_delay(n).as_secs_f64();
            assert!(
                (d - expect(n)).abs() < 1e-9,
                "attempt {n}: got {d}, want {}",
                expect(n)
            );
        }
        assert!((retry_delay(1).as_secs_f64() - 3.0).abs() < 1e-9);
        assert!((retry_delay(2).as_secs_f64() - 4.5).abs() < 1e-9);
        assert!((retry_delay(100).as_secs_f64() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn connect_populates_calibration_and_identity() {
        let sim = SimHand::new();
        sim.set_position(JointMatrix::splat(0.1));
        let mut conn = HandConnector::new(DeviceSelector::default(), sim_factory(sim));

        assert!(conn.maybe_connect(Instant::now(), false));
        assert!(conn.is_connected());
        assert_eq!(conn.limits(), Some(&SimHand::default_limits()));
        assert_eq!(
            conn.device_info().and_then(|i| i.serial.clone()),
            Some("SIM-0001".to_string())
        );
        assert_eq!(conn.initial_position(), Some(&JointMatrix::splat(0.1)));
        assert!(conn.last_error().is_none());
    }

    #[test]
    fn backoff_blocks_early_retries_and_force_bypasses() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut conn =
            HandConnector::new(DeviceSelector::default(), failing_factory(attempts.clone()));

        let t0 = Instant::now();
        assert!(!conn.maybe_connect(t0, false));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(conn.consecutive_failures(), 1);

        // Inside the 3 s window nothing happens.
        assert!(!conn.maybe_connect(t0 + Duration::from_secs(1), false));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Past the window the second attempt runs, scheduling a 4.5 s delay.
        assert!(!conn.maybe_connect(t0 + Duration::from_secs(4), false));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(conn.consecutive_failures(), 2);

        // An operator request ignores the pending window entirely.
        assert!(!conn.maybe_connect(t0 + Duration::from_secs(4), true));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(conn.last_error().is_some());
    }

    #[test]
    fn connect_resets_failure_count() {
        let sim = SimHand::new();
        let flaky = Arc::new(AtomicU32::new(0));
        let flaky_clone = flaky.clone();
        let factory: DriverFactory = Box::new(move |_| {
            if flaky_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BridgeError::Connection("still booting".to_string()))
            } else {
                Ok(Box::new(sim.clone()) as Box<dyn HandDriver>)
            }
        });
        let mut conn = HandConnector::new(DeviceSelector::default(), factory);

        let t0 = Instant::now();
        assert!(!conn.maybe_connect(t0, true));
        assert!(!conn.maybe_connect(t0, true));
        assert_eq!(conn.consecutive_failures(), 2);
        assert!(conn.maybe_connect(t0, true));
        assert_eq!(conn.consecutive_failures(), 0);
        assert!(conn.next_attempt_at().is_none());
    }

    #[test]
    fn write_failure_is_non_fatal_but_recorded() {
        let sim = SimHand::new();
        let mut conn = HandConnector::new(DeviceSelector::default(), sim_factory(sim.clone()));
        assert!(conn.maybe_connect(Instant::now(), false));

        sim.fail_writes(true);
        assert!(!conn.write_target(&JointMatrix::zeros()));
        // Still connected: a Write error is superseded, not fatal.
        assert!(conn.is_connected());
        assert!(conn.last_error().unwrap().contains("write failed"));

        sim.fail_writes(false);
        assert!(conn.write_target(&JointMatrix::zeros()));
    }

    #[test]
    fn connection_class_write_error_drops_driver() {
        #[derive(Debug)]
        struct DeadHand;
        impl HandDriver for DeadHand {
            fn device_info(&mut self) -> DeviceInfo {
                DeviceInfo::default()
            }
            fn read_joint_lower_limit(&mut self) -> Result<JointMatrix, BridgeError> {
                Ok(JointMatrix::zeros())
            }
            fn read_joint_upper_limit(&mut self) -> Result<JointMatrix, BridgeError> {
                Ok(JointMatrix::splat(1.0))
            }
            fn read_joint_actual_position(&mut self) -> Result<JointMatrix, BridgeError> {
                Ok(JointMatrix::zeros())
            }
            fn read_joint_error_code(&mut self) -> Result<JointErrorCodes, BridgeError> {
                Ok([[0; 4]; 5])
            }
            fn read_input_voltage(&mut self) -> Result<f64, BridgeError> {
                Ok(12.0)
            }
            fn write_joint_target_position(
                &mut self,
                _target: &JointMatrix,
            ) -> Result<(), BridgeError> {
                Err(BridgeError::Connection("unplugged".to_string()))
            }
            fn write_joint_enabled(&mut self, _enabled: bool) -> Result<(), BridgeError> {
                Ok(())
            }
            fn write_joint_current_limit(&mut self, _ma: u32) -> Result<(), BridgeError> {
                Ok(())
            }
            fn write_joint_reset_error(&mut self) -> Result<(), BridgeError> {
                Ok(())
            }
        }

        let factory: DriverFactory = Box::new(|_| Ok(Box::new(DeadHand) as Box<dyn HandDriver>));
        let mut conn = HandConnector::new(DeviceSelector::default(), factory);
        assert!(conn.maybe_connect(Instant::now(), false));
        assert!(!conn.write_target(&JointMatrix::zeros()));
        assert!(!conn.is_connected());
        // Calibration survives the disconnect for observers.
        assert!(conn.limits().is_some());
    }

    #[test]
    fn telemetry_readout_reflects_sim_state() {
        let sim = SimHand::new();
        sim.set_input_voltage(11.4);
        sim.inject_joint_error(2, 1, 7);
        let mut conn = HandConnector::new(DeviceSelector::default(), sim_factory(sim));
        assert!(conn.maybe_connect(Instant::now(), false));

        let readout = conn.read_telemetry().expect("connected readout");
        assert!((readout.input_voltage - 11.4).abs() < 1e-12);
        assert_eq!(readout.error_codes[2][1], 7);
    }
}
