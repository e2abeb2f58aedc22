//! Staleness watchdog for the tracking input stream.
//!
//! Ticked on its own period by the bridge: while armed, a frame older
//! than the configured timeout forces the desired target back to the safe
//! open pose.  The release still flows through the safety filter, so it
//! is a graceful transition rather than a jump, and the arm state is left
//! untouched.

use std::time::{Duration, Instant};

/// Tracks the age of the newest accepted pose frame.
#[derive(Debug, Clone)]
pub struct InputWatchdog {
    timeout: Duration,
    last_frame: Option<Instant>,
}

impl InputWatchdog {
    /// A zero timeout disables the watchdog entirely.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_frame: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a freshly accepted frame.
    pub fn frame_received(&mut self, now: Instant) {
        self.last_frame = Some(now);
    }

    /// Forget the input history (e.g. on disarm).
    pub fn clear(&mut self) {
        self.last_frame = None;
    }

    /// Age of the newest frame, if any has arrived.
    pub fn frame_age(&self, now: Instant) -> Option<Duration> {
        self.last_frame.map(|t| now.saturating_duration_since(t))
    }

    /// True when the input stream has gone quiet past the timeout.
    /// Never having received a frame counts as stale.
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.timeout.is_zero() {
            return false;
        }
        match self.last_frame {
            None => true,
            Some(t) => now.saturating_duration_since(t) > self.timeout,
        }
    }
}
