//! End-to-end tests for the outbound engine against an in-memory adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use switchboard_core::config::{ChannelConfig, SwitchboardConfig, WebhookAuthConfig, WebhookAuthMode};
use switchboard_core::types::{ChatIds, DeliveryResult, MessagePayload};
use switchboard_hooks::HookEngine;
use switchboard_outbound::adapter::{ChannelOutboundAdapter, SendContext};
use switchboard_outbound::engine::DeliverOptions;
use switchboard_outbound::{DeliveryQueue, OutboundEngine, OutboundError, OutboundRegistry};
use switchboard_sessions::{PendingOutboundTable, SessionStore};

#[derive(Default)]
struct RecordingAdapter {
    name: String,
    limit: usize,
    sent: Mutex<Vec<String>>,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl RecordingAdapter {
    fn new(name: &str, limit: usize) -> Self {
        Self {
            name: name.to_string(),
            limit,
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelOutboundAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn text_chunk_limit(&self) -> usize {
        self.limit
    }

    async fn send_text(&self, ctx: &SendContext, text: &str) -> Result<DeliveryResult, OutboundError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if call >= limit {
                return Err(OutboundError::Transient("connection reset".into()));
            }
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(DeliveryResult {
            message_id: Some(format!("m{call}")),
            to: ctx.to.clone(),
        })
    }

    async fn send_media(
        &self,
        ctx: &SendContext,
        caption: &str,
        media_url: &str,
    ) -> Result<DeliveryResult, OutboundError> {
        self.sent
            .lock()
            .unwrap()
            .push(format!("media:{media_url}:{caption}"));
        Ok(DeliveryResult {
            message_id: None,
            to: ctx.to.clone(),
        })
    }
}

fn config_with_channel(name: &str, chunk_limit: Option<usize>) -> Arc<SwitchboardConfig> {
    let mut cfg = SwitchboardConfig::default();
    cfg.channels.insert(
        name.to_string(),
        ChannelConfig {
            text_chunk_limit: chunk_limit,
            webhook: WebhookAuthConfig {
                mode: WebhookAuthMode::None,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    Arc::new(cfg)
}

struct Harness {
    engine: OutboundEngine,
    adapter: Arc<RecordingAdapter>,
    pending: Arc<PendingOutboundTable>,
    _dir: tempfile::TempDir,
    state_dir: std::path::PathBuf,
}

fn harness(adapter: RecordingAdapter, chunk_limit: Option<usize>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().to_path_buf();
    let cfg = config_with_channel(adapter.name.clone().as_str(), chunk_limit);
    let adapter = Arc::new(adapter);
    let mut registry = OutboundRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn ChannelOutboundAdapter>);
    let queue = DeliveryQueue::open(&state_dir).unwrap();
    let pending = Arc::new(PendingOutboundTable::new());
    let engine = OutboundEngine::new(
        cfg,
        registry,
        queue,
        Arc::clone(&pending),
        Arc::new(SessionStore::new()),
        Arc::new(HookEngine::new()),
    );
    Harness {
        engine,
        adapter,
        pending,
        _dir: dir,
        state_dir,
    }
}

#[tokio::test]
async fn two_chunk_send_with_echo_suppression() {
    let h = harness(RecordingAdapter::new("whatsapp", 0), Some(2));

    let mut opts = DeliverOptions::new("whatsapp", "+15550001111", vec![MessagePayload::text("abcd")]);
    opts.account_id = Some("primary".into());

    let results = h.engine.deliver(opts).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(h.adapter.sent(), vec!["ab", "cd"]);

    // Both chunks were stashed; the provider echoes them back one by one.
    assert_eq!(h.pending.len(), 2);
    assert!(h
        .pending
        .consume("primary", &ChatIds::default(), Some("+15550001111"), "ab", false)
        .is_some());
    assert!(h
        .pending
        .consume("primary", &ChatIds::default(), Some("+15550001111"), "cd", false)
        .is_some());
    // Each echo is recognised exactly once.
    assert!(h
        .pending
        .consume("primary", &ChatIds::default(), Some("+15550001111"), "cd", false)
        .is_none());

    // Queue entry was acked.
    assert!(h.engine.queue().pending().unwrap().is_empty());
}

#[tokio::test]
async fn strict_failure_keeps_queue_entry_for_recovery() {
    let mut adapter = RecordingAdapter::new("telegram", 100);
    adapter.fail_after = Some(0);
    let h = harness(adapter, None);

    let mut opts = DeliverOptions::new("telegram", "123", vec![MessagePayload::text("hello")]);
    opts.account_id = Some("bot".into());

    let err = h.engine.deliver(opts).await.unwrap_err();
    assert_eq!(err.code(), "TRANSIENT_DELIVERY_FAILURE");

    let pending = h.engine.queue().pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[0].last_error.as_deref(), Some("Transient delivery failure: connection reset"));

    // The failed send's echo stash was forgotten.
    assert!(h.pending.is_empty());
}

#[tokio::test]
async fn best_effort_partial_failure_leaves_entry_pending() {
    let mut adapter = RecordingAdapter::new("telegram", 100);
    adapter.fail_after = Some(1);
    let h = harness(adapter, None);

    let seen_errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen_errors);

    let mut opts = DeliverOptions::new(
        "telegram",
        "123",
        vec![MessagePayload::text("one"), MessagePayload::text("two")],
    );
    opts.best_effort = true;
    opts.on_error = Some(Arc::new(move |e: &str| {
        sink.lock().unwrap().push(e.to_string());
    }));

    let results = h.engine.deliver(opts).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(h.adapter.sent(), vec!["one"]);
    assert_eq!(seen_errors.lock().unwrap().len(), 1);

    // Partial success: entry stays pending (not delivered) for recovery.
    let pending = h.engine.queue().pending().unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn unconfigured_channel_fails_entry_permanently() {
    let h = harness(RecordingAdapter::new("telegram", 100), None);

    let opts = DeliverOptions::new("matrix", "!room", vec![MessagePayload::text("x")]);
    let err = h.engine.deliver(opts).await.unwrap_err();
    assert!(err.to_string().contains("Outbound not configured"));

    // Classified permanent: straight to failed/, not pending.
    assert!(h.engine.queue().pending().unwrap().is_empty());
    let failed_dir = h.state_dir.join("delivery-queue/failed");
    assert_eq!(std::fs::read_dir(failed_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn abort_acks_entry_without_sending_rest() {
    let h = harness(RecordingAdapter::new("telegram", 100), None);

    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();

    let mut opts = DeliverOptions::new("telegram", "123", vec![MessagePayload::text("never")]);
    opts.abort = Some(token);

    let results = h.engine.deliver(opts).await.unwrap();
    assert!(results.is_empty());
    assert!(h.adapter.sent().is_empty());
    // Abort converts to success-ack; nothing left to retry.
    assert!(h.engine.queue().pending().unwrap().is_empty());
}

// Paused clock: the 5 s backoff sleep auto-advances.
#[tokio::test(start_paused = true)]
async fn recovery_replays_pending_entry() {
    // Entry written by a "crashed" process: simulate by enqueueing directly.
    let dir = tempfile::tempdir().unwrap();
    {
        let queue = DeliveryQueue::open(dir.path()).unwrap();
        let entry = switchboard_outbound::DeliveryQueueEntry::new(
            "telegram",
            "123",
            vec![MessagePayload::text("replayed")],
        );
        queue.enqueue(&entry).unwrap();
    }

    let cfg = config_with_channel("telegram", None);
    let adapter = Arc::new(RecordingAdapter::new("telegram", 100));
    let mut registry = OutboundRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn ChannelOutboundAdapter>);
    let engine = OutboundEngine::new(
        cfg,
        registry,
        DeliveryQueue::open(dir.path()).unwrap(),
        Arc::new(PendingOutboundTable::new()),
        Arc::new(SessionStore::new()),
        Arc::new(HookEngine::new()),
    );

    let report = engine.recover(None).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(adapter.sent(), vec!["replayed"]);
    assert!(engine.queue().pending().unwrap().is_empty());
}

// A near-exhausted entry waits its full (capped) ten-minute slot first.
#[tokio::test(start_paused = true)]
async fn recovery_waits_capped_backoff_for_late_retries() {
    let dir = tempfile::tempdir().unwrap();
    {
        let queue = DeliveryQueue::open(dir.path()).unwrap();
        let mut entry = switchboard_outbound::DeliveryQueueEntry::new(
            "telegram",
            "123",
            vec![MessagePayload::text("fifth try")],
        );
        entry.retry_count = 4;
        entry.last_error = Some("connection reset".into());
        queue.enqueue(&entry).unwrap();
    }

    let cfg = config_with_channel("telegram", None);
    let adapter = Arc::new(RecordingAdapter::new("telegram", 100));
    let mut registry = OutboundRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn ChannelOutboundAdapter>);
    let engine = OutboundEngine::new(
        cfg,
        registry,
        DeliveryQueue::open(dir.path()).unwrap(),
        Arc::new(PendingOutboundTable::new()),
        Arc::new(SessionStore::new()),
        Arc::new(HookEngine::new()),
    );

    // Unbounded recovery budget: the entry waits out its slot, then lands.
    let report = engine.recover(None).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(adapter.sent(), vec!["fifth try"]);
    assert!(engine.queue().pending().unwrap().is_empty());
}

#[tokio::test]
async fn recovery_defers_when_budget_too_small() {
    let dir = tempfile::tempdir().unwrap();
    {
        let queue = DeliveryQueue::open(dir.path()).unwrap();
        let mut entry = switchboard_outbound::DeliveryQueueEntry::new(
            "telegram",
            "123",
            vec![MessagePayload::text("later")],
        );
        entry.retry_count = 4; // backoff slot: 10 minutes
        queue.enqueue(&entry).unwrap();
    }

    let cfg = config_with_channel("telegram", None);
    let adapter = Arc::new(RecordingAdapter::new("telegram", 100));
    let mut registry = OutboundRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn ChannelOutboundAdapter>);
    let engine = OutboundEngine::new(
        cfg,
        registry,
        DeliveryQueue::open(dir.path()).unwrap(),
        Arc::new(PendingOutboundTable::new()),
        Arc::new(SessionStore::new()),
        Arc::new(HookEngine::new()),
    );

    let report = engine
        .recover(Some(std::time::Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(report.deferred, 1);
    assert!(adapter.sent().is_empty());
    assert_eq!(engine.queue().pending().unwrap().len(), 1);
}
