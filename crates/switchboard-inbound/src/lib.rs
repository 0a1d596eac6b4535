//! `switchboard-inbound` — webhook events on their way to the agent.
//!
//! The pipeline every provider handler follows:
//! **verify → normalize → access-control → debounce → process**.
//! Verification lives in the gateway crate (it owns the HTTP surface);
//! everything after lives here. BlueBubbles is the exemplar normalizer —
//! other providers repeat the same shape.

pub mod access;
pub mod bluebubbles;
pub mod commands;
pub mod debounce;
pub mod envelope;
pub mod error;
pub mod history;
pub mod media;
pub mod mention;
pub mod pairing;
pub mod pipeline;

pub use access::{resolve_dm_group_access_decision, AccessDecision, AccessQuery, BlockReason};
pub use commands::{contains_control_command, resolve_control_command_gate, CommandGate};
pub use debounce::{DebounceQueue, ScopedMessage, DEBOUNCE_WINDOW_MS};
pub use error::{InboundError, Result};
pub use history::{HistoryFetcher, HistoryLog};
pub use mention::MentionGate;
pub use pairing::{PairingStore, PairingUpsert};
pub use pipeline::{InboundAction, InboundPipeline};
