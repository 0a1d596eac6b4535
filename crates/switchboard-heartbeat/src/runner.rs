use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchboard_core::agent::{AgentTurnDriver, AgentTurnRequest, DEFAULT_TURN_TIMEOUT_SECS};
use switchboard_core::config::{parse_hhmm, ActiveHours, HeartbeatConfig, SwitchboardConfig};
use switchboard_core::types::{now_ms, AgentId, MessagePayload};
use switchboard_hooks::{HookContext, HookEngine, HookEvent};
use switchboard_outbound::{DeliverOptions, MirrorSpec, OutboundEngine};
use switchboard_sessions::{main_session_key, SessionStore};

use crate::error::Result;
use crate::events::SystemEventQueue;
use crate::target::{resolve_heartbeat_delivery_target, HeartbeatTarget};

/// Token an agent answers with when there is nothing worth reporting.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Suppress identical heartbeat output delivered within this window.
const DUPLICATE_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Why this heartbeat is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReason {
    Interval,
    Wake,
    ExecEvent,
    CronEvent,
}

impl HeartbeatReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatReason::Interval => "interval",
            HeartbeatReason::Wake => "wake",
            HeartbeatReason::ExecEvent => "exec-event",
            HeartbeatReason::CronEvent => "cron-event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Ran,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub status: HeartbeatStatus,
    pub reason: Option<String>,
}

impl HeartbeatOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            status: HeartbeatStatus::Skipped,
            reason: Some(reason.to_string()),
        }
    }

    fn ran() -> Self {
        Self {
            status: HeartbeatStatus::Ran,
            reason: None,
        }
    }
}

/// Drives heartbeat agent turns for one gateway process.
pub struct HeartbeatRunner {
    cfg: Arc<SwitchboardConfig>,
    sessions: Arc<SessionStore>,
    events: Arc<SystemEventQueue>,
    driver: Arc<dyn AgentTurnDriver>,
    outbound: Arc<OutboundEngine>,
    hooks: Arc<HookEngine>,
}

impl HeartbeatRunner {
    pub fn new(
        cfg: Arc<SwitchboardConfig>,
        sessions: Arc<SessionStore>,
        events: Arc<SystemEventQueue>,
        driver: Arc<dyn AgentTurnDriver>,
        outbound: Arc<OutboundEngine>,
        hooks: Arc<HookEngine>,
    ) -> Self {
        Self {
            cfg,
            sessions,
            events,
            driver,
            outbound,
            hooks,
        }
    }

    pub fn events(&self) -> &Arc<SystemEventQueue> {
        &self.events
    }

    /// Run one heartbeat. The checks run in a fixed order; the first that
    /// matches decides the outcome.
    pub async fn run(
        &self,
        agent_id: Option<&str>,
        session_key: Option<&str>,
        reason: HeartbeatReason,
        explicit_target: Option<&str>,
    ) -> Result<HeartbeatOutcome> {
        let agent = agent_id.unwrap_or(&self.cfg.agents.default).to_string();

        // 1. No heartbeat config (explicit or defaulted) → disabled.
        let hb = self.heartbeat_config(&agent);
        if !hb.enabled {
            return Ok(HeartbeatOutcome::skipped("disabled"));
        }

        let session_key = session_key
            .map(str::to_string)
            .or_else(|| hb.session.clone())
            .unwrap_or_else(|| main_session_key(&agent));

        // 2. Quiet hours.
        if let Some(hours) = &hb.active_hours {
            if !within_active_hours(hours, Utc::now()) {
                return Ok(HeartbeatOutcome::skipped("quiet-hours"));
            }
        }

        // 3. Interval runs with nothing to do fast-path out.
        if reason == HeartbeatReason::Interval
            && self.heartbeat_file_is_empty(&agent)
            && !self.events.has_tagged_pending(&session_key)
        {
            return Ok(HeartbeatOutcome::skipped("empty-heartbeat-file"));
        }

        // 4. Resolve where output would land.
        let store_path = self.store_path(&agent);
        let entry = self.sessions.get(&store_path, &session_key).await?;
        let target =
            resolve_heartbeat_delivery_target(&hb, entry.as_ref(), explicit_target)?;
        let internal_only = target.channel.is_none();

        let mut request = AgentTurnRequest::new(
            AgentId(agent.clone()),
            session_key.clone(),
            self.prompt(&agent, reason, internal_only, &session_key),
        );
        request.timeout_seconds = Some(DEFAULT_TURN_TIMEOUT_SECS);
        request.internal_only = internal_only;

        let abort = CancellationToken::new();
        let payloads = self
            .driver
            .run_turn(request, abort)
            .await
            .map_err(|e| crate::error::HeartbeatError::AgentTurn(e.to_string()))?;

        if internal_only {
            debug!(agent = %agent, session = %session_key, "heartbeat ran internal-only");
            return Ok(HeartbeatOutcome::ran());
        }

        // 5. HEARTBEAT_OK suppression (reasoning still delivers).
        let Some(deliverable) = strip_ok_token(payloads) else {
            debug!(agent = %agent, session = %session_key, "heartbeat returned OK token, nothing to deliver");
            return Ok(HeartbeatOutcome::ran());
        };

        // 6. Duplicate suppression within 24 h.
        let combined = combined_text(&deliverable);
        if let Some(entry) = &entry {
            if entry.last_heartbeat_text.as_deref() == Some(combined.as_str())
                && entry
                    .last_heartbeat_sent_at
                    .map(|at| now_ms() - at <= DUPLICATE_WINDOW_MS)
                    .unwrap_or(false)
            {
                debug!(session = %session_key, "duplicate heartbeat suppressed");
                return Ok(HeartbeatOutcome::skipped("duplicate"));
            }
        }

        // 7. Deliver and record.
        self.deliver(&agent, &session_key, &target, deliverable).await?;

        self.sessions
            .upsert(&store_path, &session_key, |e| {
                e.last_heartbeat_text = Some(combined.clone());
                e.last_heartbeat_sent_at = Some(now_ms());
            })
            .await?;

        self.hooks.emit_after(
            HookContext::new(
                HookEvent::HeartbeatSent,
                json!({ "agent": agent, "reason": reason.as_str() }),
            )
            .with_session(session_key),
        );

        Ok(HeartbeatOutcome::ran())
    }

    async fn deliver(
        &self,
        agent: &str,
        session_key: &str,
        target: &HeartbeatTarget,
        payloads: Vec<MessagePayload>,
    ) -> Result<()> {
        let (Some(channel), Some(to)) = (target.channel.clone(), target.to.clone()) else {
            return Ok(());
        };

        let mut opts = DeliverOptions::new(&channel, &to, payloads);
        opts.account_id = target.account_id.clone();
        opts.thread_id = target.thread_id.clone();
        opts.session_key = Some(session_key.to_string());
        opts.mirror = Some(MirrorSpec {
            session_key: session_key.to_string(),
            agent_id: Some(agent.to_string()),
        });

        match self.outbound.deliver(opts).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(channel = %channel, error = %e, "heartbeat delivery failed");
                Err(e.into())
            }
        }
    }

    fn heartbeat_config(&self, agent: &str) -> HeartbeatConfig {
        self.cfg
            .agents
            .entries
            .get(agent)
            .and_then(|a| a.heartbeat.clone())
            .unwrap_or_else(|| self.cfg.heartbeat.clone())
    }

    fn store_path(&self, agent: &str) -> PathBuf {
        let template = self
            .cfg
            .agents
            .entries
            .get(agent)
            .and_then(|a| a.session_store.clone())
            .unwrap_or_else(|| self.cfg.session.store.clone());
        SessionStore::resolve_store_path(&template, agent)
    }

    fn heartbeat_file_is_empty(&self, agent: &str) -> bool {
        let Some(workspace) = self
            .cfg
            .agents
            .entries
            .get(agent)
            .and_then(|a| a.workspace.clone())
        else {
            // No workspace configured: nothing to read, treat as empty.
            return true;
        };
        heartbeat_file_effectively_empty(Path::new(&workspace))
    }

    fn prompt(
        &self,
        agent: &str,
        reason: HeartbeatReason,
        internal_only: bool,
        session_key: &str,
    ) -> String {
        let mut prompt = format!(
            "Heartbeat ({reason}). Review HEARTBEAT.md and any pending events, \
             then report anything that needs attention.",
            reason = reason.as_str()
        );

        let events = self.events.drain(session_key);
        if !events.is_empty() {
            prompt.push_str("\n\nPending events:\n");
            for event in events {
                prompt.push_str(&format!("- {}\n", event.text));
            }
        }

        if internal_only {
            prompt.push_str(
                "\nThis run is internal: do not address the user, reply HEARTBEAT_OK \
                 unless state must be updated.",
            );
        } else {
            prompt.push_str(&format!(
                "\nIf everything is fine reply exactly {HEARTBEAT_OK}; \
                 otherwise write the message to relay (agent {agent})."
            ));
        }
        prompt
    }
}

/// Drop the `HEARTBEAT_OK` tail from the text payloads. Returns `None` when
/// nothing deliverable remains (the all-clear case), `Some(payloads)` with
/// reasoning preserved otherwise.
fn strip_ok_token(payloads: Vec<MessagePayload>) -> Option<Vec<MessagePayload>> {
    let mut out: Vec<MessagePayload> = Vec::new();
    let mut has_content = false;

    for mut payload in payloads {
        if payload.is_reasoning {
            out.push(payload);
            continue;
        }
        let trimmed = payload.text.trim();
        if trimmed == HEARTBEAT_OK {
            continue;
        }
        if let Some(head) = trimmed.strip_suffix(HEARTBEAT_OK) {
            payload.text = head.trim_end().to_string();
        }
        if !payload.is_empty() {
            has_content = true;
            out.push(payload);
        }
    }

    if has_content {
        Some(out)
    } else if out.iter().any(|p| p.is_reasoning) {
        // Reasoning-only output still delivers (with the OK tail gone).
        Some(out)
    } else {
        None
    }
}

fn combined_text(payloads: &[MessagePayload]) -> String {
    payloads
        .iter()
        .filter(|p| !p.is_reasoning)
        .map(|p| p.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// HEARTBEAT.md counts as empty when missing, unreadable, or carrying
/// nothing but whitespace, markdown comments, and headers.
pub fn heartbeat_file_effectively_empty(workspace: &Path) -> bool {
    let path = workspace.join("HEARTBEAT.md");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return true;
    };
    strip_html_comments(&contents).lines().all(|line| {
        let trimmed = line.trim();
        trimmed.is_empty() || trimmed.starts_with('#')
    })
}

fn strip_html_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("<!--") {
        out.push_str(&rest[..open]);
        match rest[open..].find("-->") {
            Some(close) => rest = &rest[open + close + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Is `now` inside the `[start, end)` window of `hours`, in its timezone?
/// Windows may wrap midnight (22:00–06:00).
fn within_active_hours(hours: &ActiveHours, now: chrono::DateTime<Utc>) -> bool {
    let (Some(start), Some(end)) = (parse_hhmm(&hours.start), parse_hhmm(&hours.end)) else {
        // Unparseable config fails open; validation reports it separately.
        return true;
    };

    let minute_of_day = match hours.timezone.as_deref().and_then(|tz| tz.parse::<Tz>().ok()) {
        Some(tz) => {
            let local = now.with_timezone(&tz);
            local.hour() * 60 + local.minute()
        }
        None => now.hour() * 60 + now.minute(),
    };

    if start <= end {
        minute_of_day >= start && minute_of_day < end
    } else {
        minute_of_day >= start || minute_of_day < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hours(start: &str, end: &str, tz: Option<&str>) -> ActiveHours {
        ActiveHours {
            start: start.into(),
            end: end.into(),
            timezone: tz.map(str::to_string),
        }
    }

    #[test]
    fn active_hours_plain_window() {
        let h = hours("08:00", "22:00", None);
        let morning = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap();
        assert!(within_active_hours(&h, morning));
        assert!(!within_active_hours(&h, night));
    }

    #[test]
    fn active_hours_wrap_midnight() {
        let h = hours("22:00", "06:00", None);
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(within_active_hours(&h, late));
        assert!(!within_active_hours(&h, noon));
    }

    #[test]
    fn active_hours_respects_timezone() {
        // 09:00–17:00 in New York is 13:00–21:00 UTC during DST.
        let h = hours("09:00", "17:00", Some("America/New_York"));
        let utc_afternoon = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        let utc_morning = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap();
        assert!(within_active_hours(&h, utc_afternoon));
        assert!(!within_active_hours(&h, utc_morning));
    }

    #[test]
    fn ok_token_alone_suppresses_delivery() {
        let payloads = vec![MessagePayload::text(HEARTBEAT_OK)];
        assert!(strip_ok_token(payloads).is_none());
    }

    #[test]
    fn ok_tail_is_stripped_from_real_output() {
        let payloads = vec![MessagePayload::text(format!(
            "Disk filling on /var\n{HEARTBEAT_OK}"
        ))];
        let out = strip_ok_token(payloads).unwrap();
        assert_eq!(out[0].text, "Disk filling on /var");
    }

    #[test]
    fn heartbeat_file_emptiness() {
        let dir = tempfile::tempdir().unwrap();
        // Missing file is empty.
        assert!(heartbeat_file_effectively_empty(dir.path()));

        std::fs::write(
            dir.path().join("HEARTBEAT.md"),
            "# Tasks\n\n<!-- fill me in -->\n",
        )
        .unwrap();
        assert!(heartbeat_file_effectively_empty(dir.path()));

        std::fs::write(
            dir.path().join("HEARTBEAT.md"),
            "# Tasks\n- check the backups\n",
        )
        .unwrap();
        assert!(!heartbeat_file_effectively_empty(dir.path()));
    }

    #[test]
    fn reasoning_survives_ok_suppression() {
        let payloads = vec![
            MessagePayload {
                text: "considered the queue depth".into(),
                is_reasoning: true,
                ..Default::default()
            },
            MessagePayload::text(HEARTBEAT_OK),
        ];
        let out = strip_ok_token(payloads).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_reasoning);
    }
}
