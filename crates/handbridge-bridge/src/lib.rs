//! Bridge runtime: the session/telemetry hub and the control actor.
//!
//! [`Bridge`] is a single task owning all mutable control state, driven
//! by four timers (control, telemetry, watchdog, reconnect) and one
//! command channel.  [`SessionHub`] accepts WebSocket sessions and feeds
//! that channel.  [`BridgeConfig`] is the whole process configuration
//! surface: defaults → TOML file → `HANDBRIDGE_*` env vars → CLI flags.

pub mod bridge;
pub mod config;
pub mod hub;

pub use bridge::{Bridge, BridgeCommand, SESSION_QUEUE_DEPTH};
pub use config::BridgeConfig;
pub use hub::SessionHub;
