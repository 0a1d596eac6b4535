//! `switchboard-hooks` — in-process observation points.
//!
//! Components emit domain events (`message:sent`, `message:received`,
//! `delivery:failed`, …) through a shared [`HookEngine`]. Before hooks run
//! inline and may block the action; After hooks are fire-and-forget
//! observers. Tests register handlers to watch the pipeline without touching
//! component internals.

pub mod engine;
pub mod types;

pub use engine::HookEngine;
pub use types::{HookAction, HookContext, HookDefinition, HookEvent, HookHandler, HookTiming};
