//! Hardware access layer for the hand bridge.
//!
//! The vendor transport is an external collaborator; this crate pins down
//! the [`HandDriver`] trait it must implement, ships the [`SimHand`]
//! in-process simulator used by `--dry-run` and the test suite, and wraps
//! whichever driver is active in a [`HandConnector`] that owns reconnect
//! backoff and non-fatal write handling.

pub mod connector;
pub mod driver;
pub mod sim;

pub use connector::{retry_delay, DriverFactory, HandConnector, HardwareReadout};
pub use driver::{DeviceSelector, HandDriver};
pub use sim::SimHand;
