use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_core::config::SwitchboardConfig;
use switchboard_core::types::{ChatIds, DeliveryResult, MessagePayload};
use switchboard_hooks::{HookContext, HookEngine, HookEvent};
use switchboard_sessions::{PendingOutboundTable, SessionStore};

use crate::adapter::{ChannelOutboundAdapter, ChunkerMode, OutboundRegistry, SendContext};
use crate::chunk::{split_markdown_chunks, split_text_chunks};
use crate::error::{OutboundError, Result};
use crate::queue::{
    DeliveryQueue, DeliveryQueueEntry, MirrorSpec, ERROR_BACKOFF_SCHEDULE, MAX_RETRIES,
};

/// Callback invoked per payload error when `best_effort` is set.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback invoked after each successfully delivered payload.
pub type PayloadCallback = Arc<dyn Fn(&MessagePayload, &DeliveryResult) + Send + Sync>;

/// Everything [`OutboundEngine::deliver`] needs for one outbound call.
#[derive(Clone, Default)]
pub struct DeliverOptions {
    pub channel: String,
    pub to: String,
    pub account_id: Option<String>,
    pub payloads: Vec<MessagePayload>,
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
    pub identity: Option<serde_json::Value>,
    pub gif_playback: bool,
    pub silent: bool,
    pub best_effort: bool,
    pub abort: Option<CancellationToken>,
    pub mirror: Option<MirrorSpec>,
    pub session_key: Option<String>,
    /// Set by crash recovery: the entry is already journalled.
    pub skip_queue: bool,
    pub queue_id: Option<Uuid>,
    pub on_error: Option<ErrorCallback>,
    pub on_payload: Option<PayloadCallback>,
}

impl DeliverOptions {
    pub fn new(channel: &str, to: &str, payloads: Vec<MessagePayload>) -> Self {
        Self {
            channel: channel.to_string(),
            to: to.to_string(),
            payloads,
            ..Default::default()
        }
    }

    fn from_entry(entry: &DeliveryQueueEntry) -> Self {
        Self {
            channel: entry.channel.clone(),
            to: entry.to.clone(),
            account_id: entry.account_id.clone(),
            payloads: entry.payloads.clone(),
            reply_to_id: entry.reply_to_id.clone(),
            thread_id: entry.thread_id.clone(),
            gif_playback: entry.gif_playback,
            silent: entry.silent,
            best_effort: entry.best_effort,
            mirror: entry.mirror.clone(),
            session_key: entry.mirror.as_ref().map(|m| m.session_key.clone()),
            skip_queue: true,
            queue_id: Some(entry.id),
            ..Default::default()
        }
    }
}

/// Result of a startup recovery pass over the delivery queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub skipped: usize,
    pub deferred: usize,
}

/// The delivery engine: write-ahead journal, chunking, echo stash, transcript
/// mirror, and the `message:sent` internal event.
pub struct OutboundEngine {
    cfg: Arc<SwitchboardConfig>,
    registry: OutboundRegistry,
    queue: DeliveryQueue,
    pending: Arc<PendingOutboundTable>,
    sessions: Arc<SessionStore>,
    hooks: Arc<HookEngine>,
}

impl OutboundEngine {
    pub fn new(
        cfg: Arc<SwitchboardConfig>,
        registry: OutboundRegistry,
        queue: DeliveryQueue,
        pending: Arc<PendingOutboundTable>,
        sessions: Arc<SessionStore>,
        hooks: Arc<HookEngine>,
    ) -> Self {
        Self {
            cfg,
            registry,
            queue,
            pending,
            sessions,
            hooks,
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn registry(&self) -> &OutboundRegistry {
        &self.registry
    }

    /// Deliver `opts.payloads` to the channel, in order.
    ///
    /// The call is journalled before the first send and acked only after the
    /// last piece succeeds, so a crash mid-way is replayed on restart. With
    /// `best_effort`, per-payload failures are reported through `on_error`
    /// and the remaining payloads still go out; the journal entry is then
    /// failed (not acked) so recovery retries the whole call.
    pub async fn deliver(&self, opts: DeliverOptions) -> Result<Vec<DeliveryResult>> {
        // 1. Write-ahead enqueue.
        let queue_id = if opts.skip_queue {
            opts.queue_id
        } else {
            let entry = self.build_entry(&opts);
            self.queue.enqueue(&entry)?;
            Some(entry.id)
        };

        // 2. Adapter resolution.
        let adapter = match self.registry.get(&opts.channel) {
            Ok(a) => a,
            Err(e) => {
                if let Some(id) = queue_id {
                    let _ = self.queue.fail(&id, &e.to_string());
                }
                return Err(e);
            }
        };

        // 3. Payload normalization.
        let payloads = normalize_payloads(&opts.channel, opts.payloads.clone());

        let chunk_limit = self
            .cfg
            .channel(&opts.channel)
            .and_then(|c| c.text_chunk_limit)
            .unwrap_or_else(|| adapter.text_chunk_limit());

        let mut results: Vec<DeliveryResult> = Vec::new();
        let mut delivered: Vec<MessagePayload> = Vec::new();
        let mut last_error: Option<String> = None;

        for payload in payloads {
            if is_aborted(&opts) {
                return self.finish_aborted(queue_id, results);
            }

            match self
                .deliver_payload(adapter.as_ref(), &opts, &payload, chunk_limit, &mut results)
                .await
            {
                Ok(()) => {
                    self.emit_sent_event(&opts, &payload, true, None, results.last());
                    if let (Some(cb), Some(result)) = (&opts.on_payload, results.last()) {
                        cb(&payload, result);
                    }
                    delivered.push(payload);
                }
                Err(OutboundError::Aborted) => {
                    return self.finish_aborted(queue_id, results);
                }
                Err(e) => {
                    let message = e.to_string();
                    self.emit_sent_event(&opts, &payload, false, Some(&message), None);
                    if opts.best_effort {
                        if let Some(cb) = &opts.on_error {
                            cb(&message);
                        }
                        warn!(channel = %opts.channel, error = %message, "best-effort payload failed, continuing");
                        last_error = Some(message);
                        continue;
                    }
                    if let Some(id) = queue_id {
                        let _ = self.queue.fail(&id, &message);
                    }
                    return Err(e);
                }
            }
        }

        // 9. Transcript mirror — one record per call, only if anything landed.
        if !delivered.is_empty() {
            if let Some(mirror) = &opts.mirror {
                self.mirror_delivery(mirror, &delivered).await;
            }
        }

        if let Some(id) = queue_id {
            match last_error {
                // Partial best-effort failure: leave the journal pending for
                // recovery instead of acking.
                Some(err) => {
                    let _ = self.queue.fail(&id, &err);
                }
                None => self.queue.ack(&id),
            }
        }

        Ok(results)
    }

    /// Replay journalled deliveries after a restart.
    ///
    /// Entries over the retry budget go straight to `failed/`. Each remaining
    /// entry waits out its backoff slot first; when `max_recovery` cannot
    /// cover the wait, the entry is deferred to the next restart.
    pub async fn recover(&self, max_recovery: Option<Duration>) -> Result<RecoveryReport> {
        let started = Instant::now();
        let mut report = RecoveryReport::default();

        for entry in self.queue.pending()? {
            if entry.retry_count >= MAX_RETRIES {
                self.queue.move_to_failed(&entry)?;
                report.skipped += 1;
                continue;
            }

            let slot = (entry.retry_count as usize).min(ERROR_BACKOFF_SCHEDULE.len() - 1);
            let backoff = Duration::from_millis(ERROR_BACKOFF_SCHEDULE[slot]);

            if let Some(budget) = max_recovery {
                if started.elapsed() + backoff > budget {
                    info!(id = %entry.id, backoff_ms = backoff.as_millis() as u64,
                        "recovery budget exhausted, deferring entry");
                    report.deferred += 1;
                    continue;
                }
            }

            tokio::time::sleep(backoff).await;

            match self.deliver(DeliverOptions::from_entry(&entry)).await {
                Ok(_) => report.recovered += 1,
                // deliver() already recorded the failure on the entry.
                Err(e) => warn!(id = %entry.id, error = %e, "recovery attempt failed"),
            }
        }

        Ok(report)
    }

    // 4–6. Chunk, stash, and send the pieces of one payload.
    async fn deliver_payload(
        &self,
        adapter: &dyn ChannelOutboundAdapter,
        opts: &DeliverOptions,
        payload: &MessagePayload,
        chunk_limit: usize,
        results: &mut Vec<DeliveryResult>,
    ) -> Result<()> {
        // 5. Channel-native payloads bypass text handling entirely.
        if payload.channel_data.is_some() && adapter.supports_payloads() {
            let ctx = self.send_context(opts, true);
            let stash = self.stash(opts, &payload.text, !payload.media_urls.is_empty());
            match adapter.send_payload(&ctx, payload).await {
                Ok(result) => {
                    results.push(result);
                    return Ok(());
                }
                Err(e) => {
                    if let Some(id) = stash {
                        self.pending.forget(id);
                    }
                    return Err(e);
                }
            }
        }

        let text = payload.text.trim_end();
        let has_media = !payload.media_urls.is_empty();

        // Short text riding with media becomes the first media caption
        // instead of a standalone message.
        let caption_only =
            has_media && (chunk_limit == 0 || text.chars().count() <= chunk_limit.max(1));

        if !text.is_empty() && !caption_only {
            let chunks = match (chunk_limit, adapter.chunker_mode()) {
                (0, _) => vec![text.to_string()],
                (limit, ChunkerMode::Text) => split_text_chunks(text, limit),
                (limit, ChunkerMode::Markdown) => split_markdown_chunks(text, limit),
            };

            for (index, chunk) in chunks.iter().enumerate() {
                if is_aborted(opts) {
                    return Err(OutboundError::Aborted);
                }
                // Only the first chunk anchors to the reply.
                let ctx = self.send_context(opts, index == 0);
                let stash = self.stash(opts, chunk, false);
                match adapter.send_text(&ctx, chunk).await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        if let Some(id) = stash {
                            self.pending.forget(id);
                        }
                        return Err(e);
                    }
                }
            }
        }

        for (index, url) in payload.media_urls.iter().enumerate() {
            if is_aborted(opts) {
                return Err(OutboundError::Aborted);
            }
            let caption = if index == 0 && caption_only { text } else { "" };
            let ctx = self.send_context(opts, index == 0 && text.is_empty());
            let stash = self.stash(opts, caption, true);
            match adapter.send_media(&ctx, caption, url).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    if let Some(id) = stash {
                        self.pending.forget(id);
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn build_entry(&self, opts: &DeliverOptions) -> DeliveryQueueEntry {
        let mut entry =
            DeliveryQueueEntry::new(&opts.channel, &opts.to, opts.payloads.clone());
        entry.account_id = opts.account_id.clone();
        entry.thread_id = opts.thread_id.clone();
        entry.reply_to_id = opts.reply_to_id.clone();
        entry.best_effort = opts.best_effort;
        entry.gif_playback = opts.gif_playback;
        entry.silent = opts.silent;
        entry.mirror = opts.mirror.clone();
        entry
    }

    fn send_context(&self, opts: &DeliverOptions, with_reply: bool) -> SendContext {
        SendContext {
            to: opts.to.clone(),
            account_id: opts.account_id.clone(),
            reply_to_id: if with_reply { opts.reply_to_id.clone() } else { None },
            thread_id: opts.thread_id.clone(),
            identity: opts.identity.clone(),
            gif_playback: opts.gif_playback,
            silent: opts.silent,
        }
    }

    // 6. Remember the send so the provider echo is recognised.
    fn stash(&self, opts: &DeliverOptions, text: &str, has_media: bool) -> Option<u64> {
        let account = opts.account_id.as_deref()?;
        Some(self.pending.remember(
            account,
            opts.session_key.as_deref(),
            &opts.to,
            &ChatIds::default(),
            text,
            has_media,
        ))
    }

    // 7. Abort converts to a success-ack: the caller accepted cancellation,
    // so the entry must not be retried.
    fn finish_aborted(
        &self,
        queue_id: Option<Uuid>,
        results: Vec<DeliveryResult>,
    ) -> Result<Vec<DeliveryResult>> {
        debug!("delivery aborted, acking queue entry");
        if let Some(id) = queue_id {
            self.queue.ack(&id);
        }
        Ok(results)
    }

    // 9. Single transcript record per call; media appear as filenames.
    async fn mirror_delivery(&self, mirror: &MirrorSpec, delivered: &[MessagePayload]) {
        let agent_id = mirror
            .agent_id
            .clone()
            .or_else(|| agent_of_session_key(&mirror.session_key))
            .unwrap_or_else(|| self.cfg.agents.default.clone());

        let template = self
            .cfg
            .agents
            .entries
            .get(&agent_id)
            .and_then(|a| a.session_store.clone())
            .unwrap_or_else(|| self.cfg.session.store.clone());
        let store_path: PathBuf = SessionStore::resolve_store_path(&template, &agent_id);

        let mut lines = Vec::new();
        for payload in delivered {
            if !payload.text.trim().is_empty() {
                lines.push(payload.text.trim_end().to_string());
            }
            for url in &payload.media_urls {
                lines.push(media_filename(url));
            }
        }
        if lines.is_empty() {
            return;
        }

        self.sessions
            .append_transcript(&store_path, &mirror.session_key, &lines.join("\n"))
            .await;
    }

    // 10. Internal `message:sent` event per payload.
    fn emit_sent_event(
        &self,
        opts: &DeliverOptions,
        payload: &MessagePayload,
        success: bool,
        error: Option<&str>,
        result: Option<&DeliveryResult>,
    ) {
        let session = opts
            .session_key
            .clone()
            .or_else(|| opts.mirror.as_ref().map(|m| m.session_key.clone()));
        let Some(session_key) = session else {
            return;
        };

        let mut ctx = HookContext::new(
            HookEvent::MessageSent,
            json!({
                "to": opts.to,
                "content": payload.text,
                "success": success,
                "error": error,
                "channelId": opts.channel,
                "conversationId": session_key,
                "messageId": result.and_then(|r| r.message_id.clone()),
            }),
        )
        .with_channel(opts.channel.clone())
        .with_session(session_key);
        if let Some(account) = &opts.account_id {
            ctx = ctx.with_account(account.clone());
        }
        self.hooks.emit_after(ctx);
    }
}

fn is_aborted(opts: &DeliverOptions) -> bool {
    opts.abort.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
}

fn agent_of_session_key(key: &str) -> Option<String> {
    let rest = key.strip_prefix("agent:")?;
    let (agent, _) = rest.split_once(':')?;
    Some(agent.to_string())
}

/// Step 3: drop reasoning payloads, fold `MEDIA:` sentinel lines into the
/// media list, and apply the WhatsApp whitespace rules.
fn normalize_payloads(channel: &str, payloads: Vec<MessagePayload>) -> Vec<MessagePayload> {
    let mut out = Vec::with_capacity(payloads.len());

    for mut payload in payloads {
        if payload.is_reasoning {
            continue;
        }

        // MEDIA:<url> lines become media attachments.
        if payload.text.contains("MEDIA:") {
            let mut kept = Vec::new();
            for line in payload.text.lines() {
                match line.trim().strip_prefix("MEDIA:") {
                    Some(url) if !url.trim().is_empty() => {
                        payload.media_urls.push(url.trim().to_string());
                    }
                    _ => kept.push(line),
                }
            }
            payload.text = kept.join("\n");
        }

        if channel == "whatsapp" {
            // Leading blank lines are stripped even when media rides along,
            // so a blank caption stays blank. Intentionally WhatsApp-only.
            let stripped: Vec<&str> = payload
                .text
                .lines()
                .skip_while(|l| l.trim().is_empty())
                .collect();
            payload.text = stripped.join("\n");
            if payload.text.trim().is_empty() && payload.media_urls.is_empty() {
                continue;
            }
        }

        if payload.is_empty() {
            continue;
        }
        out.push(payload);
    }

    out
}

fn media_filename(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or(url)
        .to_string()
}
