use serde::{Deserialize, Serialize};
use uuid::Uuid;

use switchboard_core::types::now_ms;

use crate::error::{CronError, Result};

/// When the job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    /// Single fire at an absolute instant (ISO-8601).
    At { at: String },
    /// Fixed interval anchored at `anchor_ms` (defaults to creation time).
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// 5/6-field cron expression, evaluated in `tz`, offset by a stable
    /// per-job stagger so identical expressions do not fire simultaneously.
    #[serde(rename_all = "camelCase")]
    Cron {
        expr: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stagger_ms: Option<i64>,
    },
}

/// What a run does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronPayload {
    /// Enqueue a system event into the main session (picked up by the next
    /// heartbeat, or immediately with `wake_mode=now`).
    SystemEvent { text: String },
    /// Run an isolated agent turn.
    #[serde(rename_all = "camelCase")]
    AgentTurn {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        allow_unsafe_external_content: Option<bool>,
        // Legacy delivery fields, superseded by the job-level `delivery`
        // block but still honoured on old stores.
        #[serde(skip_serializing_if = "Option::is_none")]
        deliver: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        best_effort_deliver: Option<bool>,
    },
}

impl CronPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            CronPayload::SystemEvent { .. } => "systemEvent",
            CronPayload::AgentTurn { .. } => "agentTurn",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    #[default]
    Main,
    Isolated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    Now,
    #[default]
    NextHeartbeat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    None,
    Announce,
    Webhook,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronDelivery {
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_effort: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronRunStatus {
    Ok,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    Delivered,
    NotDelivered,
    Unknown,
    NotRequested,
}

/// Mutable run bookkeeping, all optional so an empty state serializes small.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<CronRunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery_status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_errors: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_error_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_after_run: Option<bool>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: CronSchedule,
    #[serde(default)]
    pub session_target: SessionTarget,
    #[serde(default)]
    pub wake_mode: WakeMode,
    pub payload: CronPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<CronDelivery>,
    #[serde(default)]
    pub state: CronJobState,
}

/// Caller-facing creation shape; everything defaultable is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    pub schedule: CronSchedule,
    #[serde(default)]
    pub session_target: Option<SessionTarget>,
    #[serde(default)]
    pub wake_mode: Option<WakeMode>,
    pub payload: CronPayload,
    #[serde(default)]
    pub delivery: Option<CronDelivery>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub delete_after_run: Option<bool>,
}

/// Apply defaults and check invariants, producing a storable job.
///
/// Invariants: a main-session job carries a `systemEvent` payload, an
/// isolated job an `agentTurn` payload, and webhook delivery needs a valid
/// http(s) URL in `delivery.to`.
pub fn normalize_cron_job_create(input: CronJobCreate) -> Result<CronJob> {
    let session_target = input.session_target.unwrap_or(match &input.payload {
        CronPayload::SystemEvent { .. } => SessionTarget::Main,
        CronPayload::AgentTurn { .. } => SessionTarget::Isolated,
    });

    match (session_target, &input.payload) {
        (SessionTarget::Main, CronPayload::SystemEvent { .. }) => {}
        (SessionTarget::Isolated, CronPayload::AgentTurn { .. }) => {}
        (target, payload) => {
            return Err(CronError::InvalidJob(format!(
                "session target {target:?} cannot carry a {} payload",
                payload.kind()
            )));
        }
    }

    if let Some(delivery) = &input.delivery {
        if delivery.mode == DeliveryMode::Webhook {
            let ok = delivery
                .to
                .as_deref()
                .map(|to| to.starts_with("http://") || to.starts_with("https://"))
                .unwrap_or(false);
            if !ok {
                return Err(CronError::InvalidJob(
                    "webhook delivery requires an http(s) URL in delivery.to".to_string(),
                ));
            }
        }
    }

    if let CronSchedule::At { at } = &input.schedule {
        parse_iso_ms(at)?;
    }
    if let CronSchedule::Every { every_ms, .. } = &input.schedule {
        if *every_ms <= 0 {
            return Err(CronError::InvalidJob("everyMs must be positive".to_string()));
        }
    }

    let now = now_ms();
    Ok(CronJob {
        id: Uuid::new_v4().to_string(),
        agent_id: input.agent_id,
        session_key: input.session_key,
        name: input.name,
        description: input.description,
        enabled: input.enabled.unwrap_or(true),
        delete_after_run: input.delete_after_run,
        created_at_ms: now,
        updated_at_ms: now,
        schedule: input.schedule,
        session_target,
        wake_mode: input.wake_mode.unwrap_or_default(),
        payload: input.payload,
        delivery: input.delivery,
        state: CronJobState::default(),
    })
}

/// Parse an ISO-8601 timestamp into epoch milliseconds.
pub fn parse_iso_ms(value: &str) -> Result<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| CronError::ScheduleComputation(format!("bad ISO timestamp {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_turn() -> CronPayload {
        CronPayload::AgentTurn {
            message: "summarize".into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            allow_unsafe_external_content: None,
            deliver: None,
            channel: None,
            to: None,
            best_effort_deliver: None,
        }
    }

    #[test]
    fn defaults_infer_session_target_from_payload() {
        let job = normalize_cron_job_create(CronJobCreate {
            name: "ping".into(),
            description: None,
            agent_id: None,
            session_key: None,
            schedule: CronSchedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            session_target: None,
            wake_mode: None,
            payload: CronPayload::SystemEvent { text: "ping".into() },
            delivery: None,
            enabled: None,
            delete_after_run: None,
        })
        .unwrap();
        assert_eq!(job.session_target, SessionTarget::Main);
        assert!(job.enabled);
    }

    #[test]
    fn main_target_rejects_agent_turn() {
        let err = normalize_cron_job_create(CronJobCreate {
            name: "bad".into(),
            description: None,
            agent_id: None,
            session_key: None,
            schedule: CronSchedule::Every {
                every_ms: 1000,
                anchor_ms: None,
            },
            session_target: Some(SessionTarget::Main),
            wake_mode: None,
            payload: agent_turn(),
            delivery: None,
            enabled: None,
            delete_after_run: None,
        })
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_JOB");
    }

    #[test]
    fn webhook_delivery_requires_url() {
        let err = normalize_cron_job_create(CronJobCreate {
            name: "hook".into(),
            description: None,
            agent_id: None,
            session_key: None,
            schedule: CronSchedule::Every {
                every_ms: 1000,
                anchor_ms: None,
            },
            session_target: Some(SessionTarget::Isolated),
            wake_mode: None,
            payload: agent_turn(),
            delivery: Some(CronDelivery {
                mode: DeliveryMode::Webhook,
                channel: None,
                to: Some("not a url".into()),
                best_effort: None,
            }),
            enabled: None,
            delete_after_run: None,
        })
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_JOB");
    }

    #[test]
    fn job_json_round_trips_with_camel_case_tags() {
        let job = normalize_cron_job_create(CronJobCreate {
            name: "daily".into(),
            description: Some("daily digest".into()),
            agent_id: Some("main".into()),
            session_key: None,
            schedule: CronSchedule::Cron {
                expr: "0 9 * * *".into(),
                tz: Some("Europe/Berlin".into()),
                stagger_ms: None,
            },
            session_target: Some(SessionTarget::Isolated),
            wake_mode: Some(WakeMode::Now),
            payload: agent_turn(),
            delivery: Some(CronDelivery {
                mode: DeliveryMode::Announce,
                channel: Some("telegram".into()),
                to: Some("123".into()),
                best_effort: Some(true),
            }),
            enabled: None,
            delete_after_run: Some(true),
        })
        .unwrap();

        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"kind\":\"agentTurn\""));
        assert!(json.contains("\"wakeMode\":\"now\""));
        assert!(json.contains("\"sessionTarget\":\"isolated\""));
        assert!(json.contains("\"deleteAfterRun\":true"));

        let back: CronJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn iso_parsing() {
        assert_eq!(parse_iso_ms("2025-01-01T00:00:00Z").unwrap(), 1735689600000);
        assert!(parse_iso_ms("not-a-date").is_err());
    }
}
