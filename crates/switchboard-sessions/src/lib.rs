//! `switchboard-sessions` — session identity and conversation state.
//!
//! Four pieces live here:
//!
//! - the session-key algebra ([`key`]): the deterministic mapping from
//!   `(agent, channel, peer, thread)` to a stable `:`-delimited key,
//! - the on-disk session store ([`store`]): one JSON file per agent holding
//!   `sessionKey → SessionEntry`, serialized writers per store path,
//! - the reply cache ([`replycache`]): short-id ↔ provider-UUID bijection,
//! - the pending-outbound table ([`pending`]): the in-flight send ledger used
//!   to recognise the provider's echo of our own messages.

pub mod error;
pub mod key;
pub mod pending;
pub mod replycache;
pub mod store;
pub mod transcript;

pub use error::{Result, SessionError};
pub use key::{build_agent_peer_session_key, main_session_key, PeerKind, PeerSessionRequest};
pub use pending::{PendingOutboundMessageId, PendingOutboundTable};
pub use replycache::{ReplyCache, ReplyContext};
pub use store::{SessionEntry, SessionStore};
