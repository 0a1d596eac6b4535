use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use switchboard_core::agent::{AgentTurnDriver, AgentTurnRequest};
use switchboard_core::config::SwitchboardConfig;
use switchboard_core::types::Message;
use switchboard_cron::{CronScheduler, CronStore};
use switchboard_heartbeat::{HeartbeatRunner, SystemEventKind, SystemEventQueue};
use switchboard_hooks::HookEngine;
use switchboard_inbound::media::AttachmentDownloader;
use switchboard_inbound::{InboundAction, InboundPipeline, PairingStore, ScopedMessage};
use switchboard_outbound::ack::{should_ack, AckReactor};
use switchboard_outbound::adapter::SendContext;
use switchboard_outbound::typing::TypingSession;
use switchboard_outbound::{DeliverOptions, DeliveryQueue, MirrorSpec, OutboundEngine};
use switchboard_sessions::{PendingOutboundTable, ReplyCache, SessionStore};

use crate::adapters::build_registry;
use crate::driver::HttpAgentDriver;
use crate::replay::ReplayCache;
use crate::runner::GatewayCronRunner;

/// Everything one gateway process shares across requests.
pub struct AppState {
    pub cfg: Arc<SwitchboardConfig>,
    pub sessions: Arc<SessionStore>,
    pub pipeline: Arc<InboundPipeline>,
    pub outbound: Arc<OutboundEngine>,
    pub heartbeat: Arc<HeartbeatRunner>,
    pub scheduler: Arc<CronScheduler>,
    pub driver: Arc<dyn AgentTurnDriver>,
    pub replay: ReplayCache,
    pub ack: AckReactor,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the whole core together. Returns the state and the debounce
    /// flush receiver (drive it with [`spawn_flush_consumer`]).
    pub fn build(
        cfg: SwitchboardConfig,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<ScopedMessage>)> {
        let cfg = Arc::new(cfg);
        let state_dir = PathBuf::from(&cfg.state_dir);

        let hooks = Arc::new(HookEngine::new());
        let sessions = Arc::new(SessionStore::new());
        let reply_cache = Arc::new(ReplyCache::new());
        let pending = Arc::new(PendingOutboundTable::new());
        let history = Arc::new(switchboard_inbound::HistoryLog::new());
        let pairing = Arc::new(PairingStore::open(&state_dir)?);
        let events = Arc::new(SystemEventQueue::new());

        let registry = build_registry(&cfg);
        let queue = DeliveryQueue::open(&state_dir)?;
        let outbound = Arc::new(OutboundEngine::new(
            Arc::clone(&cfg),
            registry,
            queue,
            Arc::clone(&pending),
            Arc::clone(&sessions),
            Arc::clone(&hooks),
        ));

        let driver: Arc<dyn AgentTurnDriver> = Arc::new(HttpAgentDriver::new(&cfg.agent_backend));

        let heartbeat = Arc::new(HeartbeatRunner::new(
            Arc::clone(&cfg),
            Arc::clone(&sessions),
            Arc::clone(&events),
            Arc::clone(&driver),
            Arc::clone(&outbound),
            Arc::clone(&hooks),
        ));

        let cron_store_path = cfg
            .cron
            .store
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("cron/jobs.json"));
        let cron_store = Arc::new(CronStore::open(&cron_store_path)?);
        let cron_runner = Arc::new(GatewayCronRunner::new(
            Arc::clone(&cfg),
            Arc::clone(&driver),
            Arc::clone(&outbound),
            Arc::clone(&heartbeat),
        ));
        let scheduler = Arc::new(CronScheduler::new(
            cron_store,
            cron_runner,
            Arc::clone(&hooks),
            cfg.cron.max_concurrent_runs,
        ));

        let downloader = Arc::new(AttachmentDownloader::new(&state_dir));
        let (pipeline, flush_rx) = InboundPipeline::new(
            Arc::clone(&cfg),
            reply_cache,
            pending,
            history,
            pairing,
            Arc::clone(&hooks),
            None,
            Some(downloader),
        );

        let state = Arc::new(Self {
            cfg,
            sessions,
            pipeline: Arc::new(pipeline),
            outbound,
            heartbeat,
            scheduler,
            driver,
            replay: ReplayCache::new(),
            ack: AckReactor::new(),
            shutdown: CancellationToken::new(),
        });

        Ok((state, flush_rx))
    }

    /// Startup recovery: replay the delivery queue, then start the cron loop.
    /// Runs before the HTTP listener binds.
    pub async fn recover_and_start(&self) -> anyhow::Result<()> {
        let report = self.outbound.recover(None).await?;
        if report.recovered + report.skipped + report.deferred > 0 {
            info!(
                recovered = report.recovered,
                skipped = report.skipped,
                deferred = report.deferred,
                "delivery queue recovery finished"
            );
        }
        Arc::clone(&self.scheduler).start().await?;
        Ok(())
    }

    /// Execute the actions an inbound event produced.
    pub async fn execute_actions(self: &Arc<Self>, actions: Vec<InboundAction>) {
        for action in actions {
            match action {
                InboundAction::SystemEvent { session_key, text } => {
                    self.heartbeat
                        .events()
                        .enqueue(&session_key, SystemEventKind::Notice, text);
                }
                InboundAction::PairingReply {
                    channel,
                    account_id,
                    to,
                    text,
                } => {
                    let mut opts = DeliverOptions::new(
                        &channel,
                        &to,
                        vec![switchboard_core::types::MessagePayload::text(text)],
                    );
                    opts.account_id = Some(account_id);
                    opts.best_effort = true;
                    if let Err(e) = self.outbound.deliver(opts).await {
                        warn!(channel = %channel, error = %e, "pairing reply delivery failed");
                    }
                }
                InboundAction::RunAgentTurn {
                    agent_id,
                    session_key,
                    envelope,
                    channel,
                    account_id,
                    message,
                    was_mentioned,
                    command_authorized: _,
                } => {
                    let state = Arc::clone(self);
                    // The turn can take minutes; never block the webhook loop.
                    tokio::spawn(async move {
                        state
                            .run_reply_turn(
                                agent_id.as_str(),
                                &session_key,
                                &envelope,
                                &channel,
                                &account_id,
                                &message,
                                was_mentioned,
                            )
                            .await;
                    });
                }
            }
        }
    }

    /// One reply-producing agent turn: ack + typing lifecycle around the
    /// turn, delivery with mirror, session route bookkeeping.
    #[allow(clippy::too_many_arguments)]
    async fn run_reply_turn(
        &self,
        agent_id: &str,
        session_key: &str,
        envelope: &str,
        channel: &str,
        account_id: &str,
        message: &Message,
        was_mentioned: bool,
    ) {
        let to = message
            .chat
            .canonical()
            .unwrap_or_else(|| message.sender_id.to_lowercase());

        let adapter = self.outbound.registry().get(channel).ok();
        let send_ctx = SendContext {
            to: to.clone(),
            account_id: Some(account_id.to_string()),
            ..Default::default()
        };

        // Ack reaction on the inbound message, scope permitting.
        let ack_cfg = self
            .cfg
            .channel(channel)
            .and_then(|c| c.ack_reaction.clone());
        let mut acked = false;
        if let (Some(ack), Some(adapter)) = (&ack_cfg, &adapter) {
            if should_ack(ack.scope, message.is_group, was_mentioned, was_mentioned) {
                self.ack
                    .apply(adapter.as_ref(), &send_ctx, &message.message_id, &ack.emoji)
                    .await;
                acked = true;
            }
        }

        let typing = adapter
            .as_ref()
            .map(|a| TypingSession::start(Arc::clone(a), send_ctx.clone()));

        let request = AgentTurnRequest::new(
            switchboard_core::types::AgentId(agent_id.to_string()),
            session_key,
            envelope,
        );
        let abort = self.shutdown.child_token();
        let turn = self.driver.run_turn(request, abort).await;

        if let Some(typing) = typing {
            typing.stop().await;
        }

        match turn {
            Ok(payloads) if !payloads.is_empty() => {
                let mut opts = DeliverOptions::new(channel, &to, payloads);
                opts.account_id = Some(account_id.to_string());
                opts.reply_to_id = Some(message.message_id.clone());
                opts.session_key = Some(session_key.to_string());
                if self.cfg.session.mirror_transcript {
                    opts.mirror = Some(MirrorSpec {
                        session_key: session_key.to_string(),
                        agent_id: Some(agent_id.to_string()),
                    });
                }
                if let Err(e) = self.outbound.deliver(opts).await {
                    error!(channel = %channel, session = %session_key, error = %e, "reply delivery failed");
                }
            }
            Ok(_) => {
                info!(session = %session_key, "agent turn produced no reply");
            }
            Err(e) => {
                error!(session = %session_key, error = %e, "agent turn failed");
            }
        }

        // Record the route so heartbeats can follow `target: "last"`.
        let store_path = self.agent_store_path(agent_id);
        let channel_owned = channel.to_string();
        let account_owned = account_id.to_string();
        let to_owned = to.clone();
        if let Err(e) = self
            .sessions
            .upsert(&store_path, session_key, move |entry| {
                entry.last_channel = Some(channel_owned.clone());
                entry.last_account_id = Some(account_owned.clone());
                entry.last_to = Some(to_owned.clone());
                entry.last_provider = Some(channel_owned);
            })
            .await
        {
            warn!(session = %session_key, error = %e, "session route update failed");
        }

        if let (Some(ack), Some(adapter), true) = (&ack_cfg, &adapter, acked) {
            if ack.remove_after_reply {
                self.ack
                    .remove(adapter.as_ref(), &send_ctx, &message.message_id, &ack.emoji)
                    .await;
            }
        }
    }

    pub fn agent_store_path(&self, agent_id: &str) -> PathBuf {
        let template = self
            .cfg
            .agents
            .entries
            .get(agent_id)
            .and_then(|a| a.session_store.clone())
            .unwrap_or_else(|| self.cfg.session.store.clone());
        SessionStore::resolve_store_path(&template, agent_id)
    }
}

/// Drive debounce flushes into the pipeline until shutdown.
pub fn spawn_flush_consumer(
    state: Arc<AppState>,
    mut flush_rx: mpsc::UnboundedReceiver<ScopedMessage>,
) {
    tokio::spawn(async move {
        while let Some(scoped) = flush_rx.recv().await {
            match state.pipeline.process(scoped).await {
                Ok(actions) => state.execute_actions(actions).await,
                Err(e) => warn!(error = %e, "debounced message processing failed"),
            }
        }
    });
}
