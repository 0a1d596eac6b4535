//! `switchboard-core` — shared types, configuration, and error kinds for the
//! messaging core.
//!
//! Everything here is channel-agnostic: the normalized [`types::Message`] and
//! [`types::Reaction`] records every provider webhook is parsed into, the
//! outbound [`types::MessagePayload`], the [`agent::AgentTurnDriver`] seam the
//! language-model backend plugs into, and the figment-loaded
//! [`config::SwitchboardConfig`].

pub mod agent;
pub mod config;
pub mod error;
pub mod snippet;
pub mod types;

pub use error::{CoreError, Result};
