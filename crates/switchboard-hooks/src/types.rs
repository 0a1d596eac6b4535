use serde::{Deserialize, Serialize};
use std::sync::Arc;

use switchboard_core::types::now_ms;

/// Every point in the messaging core that can be observed or intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    /// An inbound message passed access control.
    MessageReceived,
    /// One outbound payload was handed to (or rejected by) the provider.
    /// Payload fields: to, content, success, error?, channelId,
    /// conversationId, messageId?.
    MessageSent,
    /// A delivery-queue entry was moved to failed/.
    DeliveryFailed,
    /// A heartbeat run delivered output.
    HeartbeatSent,
    /// A cron job finished (any terminal status).
    CronJobCompleted,
    /// A cron job was removed after deleteAfterRun.
    CronJobRemoved,
    /// A pairing request was created for an unknown DM sender.
    PairingRequested,
}

/// Controls when a hook fires relative to the event.
///
/// Before hooks form a blocking chain; After hooks are best-effort observers
/// that must not stall the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTiming {
    Before,
    After,
}

/// The decision a Before hook returns to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum HookAction {
    Allow,
    Block { reason: String },
}

/// The runtime context passed into every hook invocation. Payload is untyped
/// JSON so the engine stays decoupled from domain structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub payload: serde_json::Value,
    pub session_key: Option<String>,
    pub channel: Option<String>,
    pub account_id: Option<String>,
    /// Unix timestamp (ms) when the event was created.
    pub timestamp: i64,
}

impl HookContext {
    pub fn new(event: HookEvent, payload: serde_json::Value) -> Self {
        Self {
            event,
            payload,
            session_key: None,
            channel: None,
            account_id: None,
            timestamp: now_ms(),
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Synchronous hook handler. Before hooks run on the caller's task, so
/// handlers must be cheap.
pub trait HookHandler: Send + Sync {
    fn handle(&self, ctx: &HookContext) -> HookAction;
}

impl<F> HookHandler for F
where
    F: Fn(&HookContext) -> HookAction + Send + Sync,
{
    fn handle(&self, ctx: &HookContext) -> HookAction {
        self(ctx)
    }
}

/// A registered hook binding a name, event filter, timing, and handler.
pub struct HookDefinition {
    /// Unique name used for deregistration and log correlation.
    pub name: String,
    pub event: HookEvent,
    pub timing: HookTiming,
    pub handler: Arc<dyn HookHandler>,
    /// Lower value runs earlier. Ties broken by registration order.
    pub priority: i32,
}

impl HookDefinition {
    pub fn new(
        name: impl Into<String>,
        event: HookEvent,
        timing: HookTiming,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            event,
            timing,
            handler,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
