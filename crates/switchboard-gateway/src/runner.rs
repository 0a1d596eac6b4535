//! Cron job execution: system events into the main session, isolated agent
//! turns with announce/webhook delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use switchboard_core::agent::{AgentTurnDriver, AgentTurnRequest};
use switchboard_core::config::SwitchboardConfig;
use switchboard_core::types::AgentId;
use switchboard_cron::{
    resolve_cron_delivery_plan, CronJob, CronJobRunner, CronPayload, DeliveryMode, DeliveryStatus,
    JobRunResult,
};
use switchboard_heartbeat::{HeartbeatReason, HeartbeatRunner, SystemEventKind};
use switchboard_outbound::{DeliverOptions, MirrorSpec, OutboundEngine};
use switchboard_sessions::main_session_key;

pub struct GatewayCronRunner {
    cfg: Arc<SwitchboardConfig>,
    driver: Arc<dyn AgentTurnDriver>,
    outbound: Arc<OutboundEngine>,
    heartbeat: Arc<HeartbeatRunner>,
    http: reqwest::Client,
}

impl GatewayCronRunner {
    pub fn new(
        cfg: Arc<SwitchboardConfig>,
        driver: Arc<dyn AgentTurnDriver>,
        outbound: Arc<OutboundEngine>,
        heartbeat: Arc<HeartbeatRunner>,
    ) -> Self {
        Self {
            cfg,
            driver,
            outbound,
            heartbeat,
            http: reqwest::Client::new(),
        }
    }

    fn agent_of(&self, job: &CronJob) -> String {
        job.agent_id
            .clone()
            .unwrap_or_else(|| self.cfg.agents.default.clone())
    }

    async fn run_system_event(&self, job: &CronJob, text: &str) -> JobRunResult {
        let agent = self.agent_of(job);
        let session_key = job
            .session_key
            .clone()
            .unwrap_or_else(|| main_session_key(&agent));

        self.heartbeat
            .events()
            .enqueue(&session_key, SystemEventKind::Cron, text);

        if job.wake_mode == switchboard_cron::WakeMode::Now {
            match self
                .heartbeat
                .run(Some(&agent), Some(&session_key), HeartbeatReason::CronEvent, None)
                .await
            {
                Ok(outcome) => {
                    info!(job_id = %job.id, status = ?outcome.status, "cron wake heartbeat ran")
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "cron wake heartbeat failed");
                    return JobRunResult::failed(&e.to_string());
                }
            }
        }

        let mut result = JobRunResult::ok();
        result.delivery_status = Some(DeliveryStatus::NotRequested);
        result
    }

    async fn run_agent_turn(&self, job: &CronJob, abort: CancellationToken) -> JobRunResult {
        let agent = self.agent_of(job);
        let CronPayload::AgentTurn {
            message,
            model,
            thinking,
            timeout_seconds,
            allow_unsafe_external_content,
            ..
        } = &job.payload
        else {
            return JobRunResult::failed("agent-turn runner got a non-agent-turn payload");
        };

        // Isolated session so the run does not pollute the main conversation.
        let session_key = job
            .session_key
            .clone()
            .unwrap_or_else(|| format!("agent:{agent}:cron:{}", job.id));

        let mut request = AgentTurnRequest::new(AgentId(agent.clone()), session_key.clone(), message);
        request.model = model.clone();
        request.thinking = thinking.clone();
        request.timeout_seconds = *timeout_seconds;
        request.allow_unsafe_external_content = allow_unsafe_external_content.unwrap_or(false);

        let payloads = match self.driver.run_turn(request, abort).await {
            Ok(payloads) => payloads,
            Err(e) => return JobRunResult::failed(&e.to_string()),
        };

        let plan = resolve_cron_delivery_plan(job);
        let mut result = JobRunResult::ok();

        if !plan.requested {
            result.delivery_status = Some(DeliveryStatus::NotRequested);
            return result;
        }
        if payloads.iter().all(|p| p.is_reasoning || p.is_empty()) {
            result.delivered = Some(false);
            result.delivery_status = Some(DeliveryStatus::NotDelivered);
            return result;
        }

        match plan.mode {
            DeliveryMode::Announce => {
                let (Some(channel), Some(to)) = (plan.channel.clone(), plan.to.clone()) else {
                    result.delivered = Some(false);
                    result.delivery_status = Some(DeliveryStatus::NotDelivered);
                    result.delivery_error = Some("announce delivery lacks channel/to".to_string());
                    return result;
                };

                let mut opts = DeliverOptions::new(&channel, &to, payloads);
                opts.best_effort = plan.best_effort;
                opts.session_key = Some(session_key.clone());
                opts.mirror = Some(MirrorSpec {
                    session_key,
                    agent_id: Some(agent),
                });

                match self.outbound.deliver(opts).await {
                    Ok(_) => {
                        // The run announced its own output; posting a summary
                        // back to main would wake the agent twice.
                        result.delivered = Some(true);
                        result.delivery_status = Some(DeliveryStatus::Delivered);
                    }
                    Err(e) => {
                        result.delivered = Some(false);
                        result.delivery_status = Some(DeliveryStatus::NotDelivered);
                        result.delivery_error = Some(e.to_string());
                    }
                }
            }
            DeliveryMode::Webhook => {
                let Some(url) = plan.to.clone() else {
                    result.delivered = Some(false);
                    result.delivery_status = Some(DeliveryStatus::NotDelivered);
                    result.delivery_error = Some("webhook delivery lacks URL".to_string());
                    return result;
                };
                let body = serde_json::json!({
                    "jobId": job.id,
                    "name": job.name,
                    "payloads": payloads,
                });
                match self.http.post(&url).json(&body).send().await {
                    Ok(response) if response.status().is_success() => {
                        result.delivered = Some(true);
                        result.delivery_status = Some(DeliveryStatus::Delivered);
                    }
                    Ok(response) => {
                        result.delivered = Some(false);
                        result.delivery_status = Some(DeliveryStatus::NotDelivered);
                        result.delivery_error = Some(format!("webhook returned {}", response.status()));
                    }
                    Err(e) => {
                        result.delivered = Some(false);
                        result.delivery_status = Some(DeliveryStatus::NotDelivered);
                        result.delivery_error = Some(e.to_string());
                    }
                }
            }
            DeliveryMode::None => {
                result.delivery_status = Some(DeliveryStatus::NotRequested);
            }
        }

        result
    }
}

#[async_trait]
impl CronJobRunner for GatewayCronRunner {
    async fn run(&self, job: &CronJob, abort: CancellationToken) -> JobRunResult {
        match &job.payload {
            CronPayload::SystemEvent { text } => self.run_system_event(job, text).await,
            CronPayload::AgentTurn { .. } => self.run_agent_turn(job, abort).await,
        }
    }
}
