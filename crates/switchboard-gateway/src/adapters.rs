//! Generic REST-push outbound adapter.
//!
//! Bridge-style providers (BlueBubbles, WhatsApp bridges, webchat) accept
//! outbound messages on a REST endpoint. One adapter instance serves one
//! channel; its endpoint and chunking posture come from the channel config.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use switchboard_core::config::{ChannelConfig, SwitchboardConfig};
use switchboard_core::types::{DeliveryResult, MessagePayload};
use switchboard_outbound::adapter::{ChannelOutboundAdapter, ChunkerMode, SendContext};
use switchboard_outbound::{OutboundError, OutboundRegistry};

pub struct HttpPushAdapter {
    name: String,
    endpoint: String,
    token: Option<String>,
    chunk_limit: usize,
    client: reqwest::Client,
}

impl HttpPushAdapter {
    pub fn new(name: &str, channel: &ChannelConfig, endpoint: &str) -> Self {
        let token = channel
            .accounts
            .values()
            .find_map(|a| a.token.clone())
            .or_else(|| channel.accounts.values().find_map(|a| a.password.clone()));
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            token,
            chunk_limit: channel.text_chunk_limit.unwrap_or(0),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, body: serde_json::Value) -> Result<DeliveryResult, OutboundError> {
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OutboundError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("{}: {}", status, text);
            // 4xx from the bridge means the destination is gone, not flaky.
            return if status.is_client_error() {
                Err(OutboundError::Permanent(message))
            } else {
                Err(OutboundError::Transient(message))
            };
        }

        let message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| {
                v.get("messageId")
                    .or_else(|| v.get("guid"))
                    .and_then(|id| id.as_str().map(str::to_string))
            });

        Ok(DeliveryResult {
            message_id,
            to: body
                .get("to")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[async_trait]
impl ChannelOutboundAdapter for HttpPushAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn text_chunk_limit(&self) -> usize {
        self.chunk_limit
    }

    fn chunker_mode(&self) -> ChunkerMode {
        ChunkerMode::Markdown
    }

    async fn send_text(
        &self,
        ctx: &SendContext,
        text: &str,
    ) -> Result<DeliveryResult, OutboundError> {
        self.post(json!({
            "type": "text",
            "to": ctx.to,
            "accountId": ctx.account_id,
            "text": text,
            "replyToId": ctx.reply_to_id,
            "threadId": ctx.thread_id,
            "silent": ctx.silent,
        }))
        .await
    }

    async fn send_media(
        &self,
        ctx: &SendContext,
        caption: &str,
        media_url: &str,
    ) -> Result<DeliveryResult, OutboundError> {
        self.post(json!({
            "type": "media",
            "to": ctx.to,
            "accountId": ctx.account_id,
            "caption": caption,
            "mediaUrl": media_url,
            "gifPlayback": ctx.gif_playback,
        }))
        .await
    }

    async fn set_typing(&self, ctx: &SendContext, on: bool) -> Result<(), OutboundError> {
        let _ = self
            .post(json!({ "type": "typing", "to": ctx.to, "on": on }))
            .await?;
        Ok(())
    }

    async fn react(
        &self,
        ctx: &SendContext,
        message_id: &str,
        emoji: &str,
        add: bool,
    ) -> Result<(), OutboundError> {
        let _ = self
            .post(json!({
                "type": "reaction",
                "to": ctx.to,
                "messageId": message_id,
                "emoji": emoji,
                "action": if add { "add" } else { "remove" },
            }))
            .await?;
        Ok(())
    }
}

/// Register a push adapter for every channel that configures `outbound_url`.
pub fn build_registry(cfg: &SwitchboardConfig) -> OutboundRegistry {
    let mut registry = OutboundRegistry::new();
    for (name, channel) in &cfg.channels {
        match &channel.outbound_url {
            Some(endpoint) => {
                registry.register(std::sync::Arc::new(HttpPushAdapter::new(
                    name, channel, endpoint,
                )));
            }
            None => debug!(channel = %name, "no outbound_url, channel is inbound-only"),
        }
    }
    registry
}
