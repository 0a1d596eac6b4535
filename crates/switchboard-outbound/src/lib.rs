//! `switchboard-outbound` — the delivery engine.
//!
//! Outbound payloads go through a write-ahead queue on disk, get chunked to
//! the channel's limits, and are sent through a registered
//! [`adapter::ChannelOutboundAdapter`]. Failures are classified transient or
//! permanent; transient entries survive crashes and are retried with
//! exponential backoff on startup. Every send is stashed in the
//! pending-outbound ledger so the provider's echo of our own message is
//! recognised instead of reprocessed.

pub mod ack;
pub mod adapter;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod queue;
pub mod typing;

pub use adapter::{ChannelOutboundAdapter, ChunkerMode, OutboundRegistry, SendContext};
pub use engine::{DeliverOptions, OutboundEngine};
pub use error::{OutboundError, Result};
pub use queue::{DeliveryQueue, DeliveryQueueEntry, MirrorSpec, ERROR_BACKOFF_SCHEDULE, MAX_RETRIES};
