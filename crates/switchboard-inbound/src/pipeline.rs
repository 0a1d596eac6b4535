//! The inbound pipeline: access control, echo reconciliation, debounce, and
//! enrichment, producing actions for the gateway to execute.
//!
//! The pipeline never sends anything itself — it returns [`InboundAction`]s
//! (run an agent turn, enqueue a system event, send a pairing reply) so the
//! HTTP layer stays the only component talking to the outside world.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_core::config::{ChannelConfig, SwitchboardConfig};
use switchboard_core::snippet::normalize_snippet;
use switchboard_core::types::{AgentId, HistoryEntry, InboundEvent, Message};
use switchboard_hooks::{HookContext, HookEngine, HookEvent};
use switchboard_routing::{resolve_agent_route, PeerInfo};
use switchboard_sessions::{PendingOutboundTable, ReplyCache};

use crate::access::{
    group_allowlist_hint, list_matches, resolve_dm_group_access_decision, AccessDecision,
    AccessQuery, BlockReason,
};
use crate::commands::{contains_control_command, resolve_control_command_gate};
use crate::debounce::{DebounceQueue, ScopedMessage, DEBOUNCE_WINDOW_MS};
use crate::envelope::InboundEnvelope;
use crate::error::Result;
use crate::history::{HistoryFetcher, HistoryLog};
use crate::media::AttachmentDownloader;
use crate::mention::MentionGate;
use crate::pairing::{pairing_reply_text, PairingStore, PairingUpsert};

/// What the gateway should do next for an inbound event.
#[derive(Debug, Clone)]
pub enum InboundAction {
    /// Drive a reply-producing agent turn with the canonical envelope.
    RunAgentTurn {
        agent_id: AgentId,
        session_key: String,
        envelope: String,
        channel: String,
        account_id: String,
        message: Message,
        was_mentioned: bool,
        command_authorized: bool,
    },
    /// Enqueue a system event into a session (picked up by the heartbeat).
    SystemEvent { session_key: String, text: String },
    /// Send the one-time pairing reply to an unknown DM sender.
    PairingReply {
        channel: String,
        account_id: String,
        to: String,
        text: String,
    },
}

/// Shared state for one gateway process. Provider webhook handlers feed
/// [`handle_event`](InboundPipeline::handle_event); debounced flushes come
/// back through the receiver returned by [`new`](InboundPipeline::new) and
/// are fed to [`process`](InboundPipeline::process).
pub struct InboundPipeline {
    cfg: Arc<SwitchboardConfig>,
    reply_cache: Arc<ReplyCache>,
    pending: Arc<PendingOutboundTable>,
    history: Arc<HistoryLog>,
    pairing: Arc<PairingStore>,
    hooks: Arc<HookEngine>,
    debounce: DebounceQueue,
    history_fetcher: Option<Arc<dyn HistoryFetcher>>,
    downloader: Option<Arc<AttachmentDownloader>>,
}

impl InboundPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<SwitchboardConfig>,
        reply_cache: Arc<ReplyCache>,
        pending: Arc<PendingOutboundTable>,
        history: Arc<HistoryLog>,
        pairing: Arc<PairingStore>,
        hooks: Arc<HookEngine>,
        history_fetcher: Option<Arc<dyn HistoryFetcher>>,
        downloader: Option<Arc<AttachmentDownloader>>,
    ) -> (Self, mpsc::UnboundedReceiver<ScopedMessage>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let debounce = DebounceQueue::new(Duration::from_millis(DEBOUNCE_WINDOW_MS), flush_tx);
        (
            Self {
                cfg,
                reply_cache,
                pending,
                history,
                pairing,
                hooks,
                debounce,
                history_fetcher,
                downloader,
            },
            flush_rx,
        )
    }

    /// Graceful shutdown: flush buffered messages immediately.
    pub fn stop(&self) {
        self.debounce.stop();
    }

    /// Entry point for a verified, normalized webhook event.
    pub async fn handle_event(
        &self,
        channel: &str,
        account_id: &str,
        event: InboundEvent,
    ) -> Result<Vec<InboundAction>> {
        match event {
            InboundEvent::NewMessage { data } | InboundEvent::UpdatedMessage { data } => {
                self.handle_message(channel, account_id, data).await
            }
            InboundEvent::MessageReaction { data } | InboundEvent::Reaction { data } => {
                debug!(
                    channel,
                    message = %data.message_id,
                    emoji = %data.emoji,
                    action = ?data.action,
                    "reaction observed"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn handle_message(
        &self,
        channel: &str,
        account_id: &str,
        message: Message,
    ) -> Result<Vec<InboundAction>> {
        if message.from_me {
            return Ok(self.reconcile_echo(channel, account_id, &message));
        }

        let channel_cfg = self.channel_cfg(channel);
        let chat_token = message
            .chat
            .canonical()
            .unwrap_or_else(|| message.sender_id.to_lowercase());

        let query = AccessQuery {
            is_group: message.is_group,
            dm_policy: channel_cfg.dm_policy,
            group_policy: channel_cfg.group_policy,
            effective_allow_from: &channel_cfg.allow_from,
            effective_group_allow_from: &channel_cfg.group_allow_from,
            is_sender_allowed: list_matches(&channel_cfg.allow_from, &message.sender_id),
            is_group_allowed: list_matches(&channel_cfg.group_allow_from, &chat_token),
        };

        match resolve_dm_group_access_decision(&query) {
            AccessDecision::Block(reason) => {
                let hint = matches!(
                    reason,
                    BlockReason::GroupAllowlistEmpty | BlockReason::GroupNotAllowlisted
                )
                .then(|| group_allowlist_hint(channel, &chat_token));
                info!(
                    channel,
                    sender = %message.sender_id,
                    reason = reason.as_str(),
                    hint = hint.as_deref().unwrap_or(""),
                    "inbound blocked by access policy"
                );
                return Ok(Vec::new());
            }
            AccessDecision::Pairing => {
                return self.start_pairing(channel, account_id, &message);
            }
            AccessDecision::Allow => {}
        }

        let gates = self.evaluate_gates(channel, &channel_cfg, &message, &chat_token);
        if gates.should_block {
            info!(
                channel,
                sender = %message.sender_id,
                "unauthorised control command in group dropped"
            );
            return Ok(Vec::new());
        }
        if message.is_group && !gates.process_group {
            debug!(channel, sender = %message.sender_id, "group message without mention dropped");
            return Ok(Vec::new());
        }

        let scoped = ScopedMessage {
            channel: channel.to_string(),
            account_id: account_id.to_string(),
            message,
        };
        match self.debounce.offer(scoped) {
            Some(passthrough) => self.process(passthrough).await,
            None => Ok(Vec::new()),
        }
    }

    /// Enrichment and routing for a debounced (or bypassing) message.
    pub async fn process(&self, scoped: ScopedMessage) -> Result<Vec<InboundAction>> {
        let ScopedMessage {
            channel,
            account_id,
            mut message,
        } = scoped;
        let channel_cfg = self.channel_cfg(&channel);
        let chat_token = message
            .chat
            .canonical()
            .unwrap_or_else(|| message.sender_id.to_lowercase());

        // Remember the inbound message so replies can reference it by short id.
        let sender_label = message
            .sender_name
            .clone()
            .unwrap_or_else(|| message.sender_id.clone());
        let short_id = self.reply_cache.remember(
            &account_id,
            &message.message_id,
            &message.chat,
            &sender_label,
            &message.text,
            message.timestamp,
        );

        self.history.observe(
            &account_id,
            &chat_token,
            HistoryEntry {
                sender: sender_label.clone(),
                body: message.text.clone(),
                timestamp: Some(message.timestamp),
                message_id: Some(message.message_id.clone()),
            },
            channel_cfg.history_limit,
        );
        if let Some(fetcher) = &self.history_fetcher {
            self.history
                .backfill_tick(fetcher.as_ref(), &account_id, &chat_token, channel_cfg.history_limit)
                .await;
        }

        // Reply context: cache first, raw payload as fallback.
        let (reply_short, reply_full) = match message.reply_to_id.as_deref() {
            Some(reply_to) => {
                match self
                    .reply_cache
                    .resolve_reply_context(&account_id, reply_to, &message.chat)
                {
                    Some(ctx) => (Some(format!("[{}]", ctx.short_id)), Some(reply_to.to_string())),
                    None => (None, Some(reply_to.to_string())),
                }
            }
            None => (None, None),
        };

        self.download_attachments(&channel_cfg, &account_id, &mut message).await;

        let history_snapshot = self.history.snapshot(&account_id, &chat_token);
        let gates = self.evaluate_gates(&channel, &channel_cfg, &message, &chat_token);

        let peer = if message.is_group {
            PeerInfo::group(chat_token.clone())
        } else {
            PeerInfo::direct(message.sender_id.clone())
        };
        let route = resolve_agent_route(&self.cfg, &channel, Some(&account_id), &peer)?;

        let envelope = InboundEnvelope {
            from: format!("{sender_label} ({})", message.sender_id),
            timestamp: message.timestamp,
            body: message.text.clone(),
            reply_to_id: reply_short,
            reply_to_id_full: reply_full,
            message_sid: Some(format!("[{short_id}]")),
            message_sid_full: Some(message.message_id.clone()),
            was_mentioned: gates.was_mentioned,
            command_authorized: gates.command_authorized,
            originating_channel: channel.clone(),
            originating_to: chat_token,
            history: Some(history_snapshot),
        };

        self.hooks.emit_after(
            HookContext::new(
                HookEvent::MessageReceived,
                json!({
                    "messageId": message.message_id,
                    "sender": message.sender_id,
                    "isGroup": message.is_group,
                }),
            )
            .with_channel(channel.clone())
            .with_account(account_id.clone())
            .with_session(route.session_key.clone()),
        );

        Ok(vec![InboundAction::RunAgentTurn {
            agent_id: route.agent_id,
            session_key: route.session_key,
            envelope: envelope.format(),
            channel,
            account_id,
            message,
            was_mentioned: gates.was_mentioned,
            command_authorized: gates.command_authorized,
        }])
    }

    /// `fromMe` handling: refresh the reply cache, and when the message is
    /// the echo of one of our own sends, emit an "Assistant sent" system
    /// event into the sending session.
    fn reconcile_echo(
        &self,
        channel: &str,
        account_id: &str,
        message: &Message,
    ) -> Vec<InboundAction> {
        let short_id = self.reply_cache.remember(
            account_id,
            &message.message_id,
            &message.chat,
            "assistant",
            &message.text,
            message.timestamp,
        );

        let consumed = self.pending.consume(
            account_id,
            &message.chat,
            None,
            &message.text,
            !message.attachments.is_empty(),
        );

        let Some(entry) = consumed else {
            debug!(channel, message = %message.message_id, "fromMe echo with no pending match");
            return Vec::new();
        };

        info!(
            channel,
            message = %message.message_id,
            pending = entry.id,
            "outbound echo reconciled"
        );

        let Some(session_key) = entry.session_key else {
            return Vec::new();
        };
        let snippet = normalize_snippet(&message.text);
        vec![InboundAction::SystemEvent {
            session_key,
            text: format!("Assistant sent [{short_id}]: {snippet}"),
        }]
    }

    fn start_pairing(
        &self,
        channel: &str,
        account_id: &str,
        message: &Message,
    ) -> Result<Vec<InboundAction>> {
        let upsert = self.pairing.upsert(
            channel,
            &message.sender_id,
            Some(json!({ "accountId": account_id })),
        )?;

        match upsert {
            PairingUpsert::Created { code } => {
                self.hooks.emit_after(
                    HookContext::new(
                        HookEvent::PairingRequested,
                        json!({ "sender": message.sender_id, "code": code }),
                    )
                    .with_channel(channel.to_string()),
                );
                Ok(vec![InboundAction::PairingReply {
                    channel: channel.to_string(),
                    account_id: account_id.to_string(),
                    to: message.sender_id.clone(),
                    text: pairing_reply_text(&message.sender_id, &code),
                }])
            }
            // The reply goes out exactly once, on creation.
            PairingUpsert::Existing => Ok(Vec::new()),
        }
    }

    async fn download_attachments(
        &self,
        channel_cfg: &ChannelConfig,
        account_id: &str,
        message: &mut Message,
    ) {
        let Some(downloader) = &self.downloader else {
            return;
        };
        let cap = self
            .cfg
            .channels
            .values()
            .find_map(|c| c.accounts.get(account_id).and_then(|a| a.max_attachment_bytes))
            .unwrap_or(channel_cfg.max_attachment_bytes);

        for attachment in &mut message.attachments {
            let Some(url) = attachment.url.clone() else {
                continue;
            };
            match downloader.download(&url, cap).await {
                Ok(path) => attachment.local_path = Some(path.to_string_lossy().to_string()),
                Err(e) => {
                    warn!(url, error = %e, "attachment download failed");
                }
            }
        }
    }

    fn evaluate_gates(
        &self,
        _channel: &str,
        channel_cfg: &ChannelConfig,
        message: &Message,
        _chat_token: &str,
    ) -> GateOutcome {
        let mention_gate = MentionGate::new(&channel_cfg.mention_patterns);
        let has_command = contains_control_command(&message.text);
        let sender_is_owner = list_matches(&channel_cfg.owners, &message.sender_id);
        let sender_in_group_allowlist =
            list_matches(&channel_cfg.group_allow_from, &message.sender_id);

        let gate = resolve_control_command_gate(
            has_command,
            sender_is_owner,
            sender_in_group_allowlist,
            channel_cfg.use_access_groups,
            message.is_group,
        );

        GateOutcome {
            was_mentioned: mention_gate.is_mentioned(&message.text),
            command_authorized: gate.command_authorized,
            should_block: gate.should_block,
            process_group: mention_gate
                .should_process_group_message(&message.text, gate.command_authorized),
        }
    }

    fn channel_cfg(&self, channel: &str) -> ChannelConfig {
        self.cfg.channel(channel).cloned().unwrap_or_default()
    }
}

struct GateOutcome {
    was_mentioned: bool,
    command_authorized: bool,
    should_block: bool,
    process_group: bool,
}
