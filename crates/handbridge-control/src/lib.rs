//! Control-side logic of the hand bridge: calibration, pose mapping, the
//! safety filter, the arm lifecycle state machine, and the input watchdog.
//!
//! Everything here is pure state + arithmetic: no I/O, no clocks of its
//! own (callers pass `Instant`s), no transport.  That keeps the
//! safety-relevant pieces testable without hardware or a runtime.

pub mod arming;
pub mod calibration;
pub mod filter;
pub mod mapping;
pub mod watchdog;

pub use arming::{ArmStateMachine, ArmTimings, HandAction, ResetKind, TickOutcome};
pub use calibration::{derive_open_closed, safe_open_pose, MappingConfig, PoseMode};
pub use filter::{FilterParams, SafetyFilter};
pub use mapping::map_frame;
pub use watchdog::InputWatchdog;
