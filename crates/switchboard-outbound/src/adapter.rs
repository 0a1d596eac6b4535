use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use switchboard_core::types::{DeliveryResult, MessagePayload};

use crate::error::{OutboundError, Result};

/// How the channel's text is split when it exceeds the chunk limit.
///
/// `Text` splits by length on whitespace boundaries; `Markdown` splits on
/// newlines while keeping fenced code blocks and tables intact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkerMode {
    #[default]
    Text,
    Markdown,
}

/// Per-send context handed to every adapter call.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    pub to: String,
    pub account_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
    /// Identity override (display name / avatar) where the channel allows it.
    pub identity: Option<serde_json::Value>,
    pub gif_playback: bool,
    pub silent: bool,
}

/// Common interface implemented by every channel's outbound side.
///
/// Implementations must be `Send + Sync` so they can be stored in an
/// [`OutboundRegistry`] and driven from multiple Tokio tasks. Only
/// `send_text` and `send_media` are mandatory; the rest have no-op or
/// unsupported defaults.
#[async_trait]
pub trait ChannelOutboundAdapter: Send + Sync {
    /// Stable lowercase identifier, unique across registered adapters.
    fn name(&self) -> &str;

    /// Default per-message character limit. Zero disables chunking.
    fn text_chunk_limit(&self) -> usize {
        0
    }

    fn chunker_mode(&self) -> ChunkerMode {
        ChunkerMode::Text
    }

    /// Whether `send_payload` is implemented for channel-native content.
    fn supports_payloads(&self) -> bool {
        false
    }

    async fn send_text(&self, ctx: &SendContext, text: &str) -> Result<DeliveryResult>;

    async fn send_media(
        &self,
        ctx: &SendContext,
        caption: &str,
        media_url: &str,
    ) -> Result<DeliveryResult>;

    /// Channel-native rich payloads (blocks, embeds, cards).
    async fn send_payload(
        &self,
        _ctx: &SendContext,
        _payload: &MessagePayload,
    ) -> Result<DeliveryResult> {
        Err(OutboundError::PayloadUnsupported(self.name().to_string()))
    }

    /// Typing indicator; channels without one ignore this.
    async fn set_typing(&self, _ctx: &SendContext, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Add or remove an emoji reaction on a message.
    async fn react(
        &self,
        _ctx: &SendContext,
        _message_id: &str,
        _emoji: &str,
        _add: bool,
    ) -> Result<()> {
        Ok(())
    }
}

/// Registry of channel adapters keyed by [`ChannelOutboundAdapter::name`].
///
/// Registering a second adapter under the same name replaces the first.
pub struct OutboundRegistry {
    adapters: HashMap<String, Arc<dyn ChannelOutboundAdapter>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelOutboundAdapter>) {
        let name = adapter.name().to_string();
        info!(channel = %name, "registering outbound adapter");
        self.adapters.insert(name, adapter);
    }

    pub fn get(&self, channel: &str) -> Result<Arc<dyn ChannelOutboundAdapter>> {
        self.adapters
            .get(channel)
            .cloned()
            .ok_or_else(|| OutboundError::NotConfigured(channel.to_string()))
    }

    /// Registered channel names, sorted for deterministic output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for OutboundRegistry {
    fn default() -> Self {
        Self::new()
    }
}
