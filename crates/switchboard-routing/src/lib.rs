//! `switchboard-routing` — who answers, and where the answer lands.
//!
//! Inbound: [`resolve_agent_route`] maps `(channel, account, peer)` to the
//! owning agent and its session key. Outbound: [`resolve_outbound_session_route`]
//! parses a destination expression and computes the session the send is
//! mirrored into. Tool-initiated sends that hop providers go through
//! [`enforce_cross_context_policy`].

pub mod crosscontext;
pub mod error;
pub mod route;
pub mod target;

pub use crosscontext::{enforce_cross_context_policy, CrossContextOutcome};
pub use error::{Result, RoutingError};
pub use route::{resolve_agent_route, PeerInfo, ResolvedRoute};
pub use target::{resolve_outbound_session_route, OutboundRoute};
