use crate::types::{CronDelivery, CronJob, CronPayload, DeliveryMode};

/// Where (and whether) an isolated job's output goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CronDeliveryPlan {
    pub requested: bool,
    pub mode: DeliveryMode,
    pub channel: Option<String>,
    pub to: Option<String>,
    pub best_effort: bool,
}

/// Combine the job's `delivery` block with the legacy payload fields.
///
/// The explicit block wins; old stores that only set
/// `payload.deliver/channel/to/bestEffortDeliver` resolve to announce mode.
/// System-event jobs never request delivery — their text lands in the main
/// session instead.
pub fn resolve_cron_delivery_plan(job: &CronJob) -> CronDeliveryPlan {
    let CronPayload::AgentTurn {
        deliver,
        channel,
        to,
        best_effort_deliver,
        ..
    } = &job.payload
    else {
        return CronDeliveryPlan::default();
    };

    if let Some(CronDelivery {
        mode,
        channel,
        to,
        best_effort,
    }) = &job.delivery
    {
        if *mode != DeliveryMode::None {
            return CronDeliveryPlan {
                requested: true,
                mode: *mode,
                channel: channel.clone(),
                to: to.clone(),
                best_effort: best_effort.unwrap_or(false),
            };
        }
        return CronDeliveryPlan::default();
    }

    // Legacy fallback.
    if deliver.unwrap_or(false) {
        return CronDeliveryPlan {
            requested: true,
            mode: DeliveryMode::Announce,
            channel: channel.clone(),
            to: to.clone(),
            best_effort: best_effort_deliver.unwrap_or(false),
        };
    }

    CronDeliveryPlan::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CronJobState, CronSchedule, SessionTarget, WakeMode};

    fn job(payload: CronPayload, delivery: Option<CronDelivery>) -> CronJob {
        CronJob {
            id: "j1".into(),
            agent_id: None,
            session_key: None,
            name: "t".into(),
            description: None,
            enabled: true,
            delete_after_run: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            schedule: CronSchedule::Every {
                every_ms: 1000,
                anchor_ms: None,
            },
            session_target: SessionTarget::Isolated,
            wake_mode: WakeMode::NextHeartbeat,
            payload,
            delivery,
            state: CronJobState::default(),
        }
    }

    fn agent_turn_legacy(deliver: Option<bool>) -> CronPayload {
        CronPayload::AgentTurn {
            message: "m".into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            allow_unsafe_external_content: None,
            deliver,
            channel: Some("telegram".into()),
            to: Some("123".into()),
            best_effort_deliver: Some(true),
        }
    }

    #[test]
    fn system_event_never_requests_delivery() {
        let plan = resolve_cron_delivery_plan(&job(
            CronPayload::SystemEvent { text: "x".into() },
            Some(CronDelivery {
                mode: DeliveryMode::Announce,
                channel: Some("telegram".into()),
                to: Some("123".into()),
                best_effort: None,
            }),
        ));
        assert!(!plan.requested);
    }

    #[test]
    fn delivery_block_wins_over_legacy_fields() {
        let plan = resolve_cron_delivery_plan(&job(
            agent_turn_legacy(Some(true)),
            Some(CronDelivery {
                mode: DeliveryMode::Webhook,
                channel: None,
                to: Some("https://hooks.test/x".into()),
                best_effort: None,
            }),
        ));
        assert_eq!(plan.mode, DeliveryMode::Webhook);
        assert_eq!(plan.to.as_deref(), Some("https://hooks.test/x"));
    }

    #[test]
    fn legacy_deliver_flag_resolves_to_announce() {
        let plan = resolve_cron_delivery_plan(&job(agent_turn_legacy(Some(true)), None));
        assert!(plan.requested);
        assert_eq!(plan.mode, DeliveryMode::Announce);
        assert_eq!(plan.channel.as_deref(), Some("telegram"));
        assert!(plan.best_effort);
    }

    #[test]
    fn no_delivery_anywhere_means_not_requested() {
        let plan = resolve_cron_delivery_plan(&job(agent_turn_legacy(None), None));
        assert!(!plan.requested);
    }
}
