//! `switchboard-heartbeat` — periodic and on-demand operational agent turns.
//!
//! A heartbeat is an agent turn bound to a session, fired on an interval or
//! woken by cron/exec events. Quiet hours, an empty tasks file, the
//! `HEARTBEAT_OK` token, and a 24-hour duplicate window all suppress
//! delivery so heartbeats stay quiet unless something needs saying.

pub mod error;
pub mod events;
pub mod runner;
pub mod target;

pub use error::{HeartbeatError, Result};
pub use events::{SystemEvent, SystemEventKind, SystemEventQueue};
pub use runner::{HeartbeatOutcome, HeartbeatReason, HeartbeatRunner, HeartbeatStatus, HEARTBEAT_OK};
pub use target::{resolve_heartbeat_delivery_target, HeartbeatTarget};
