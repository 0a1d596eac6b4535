//! HTTP-backed agent turn driver.
//!
//! The language model is an opaque collaborator: the gateway POSTs the turn
//! request to the configured backend endpoint and receives reply payloads.
//! Deployments without a backend get an ingest-only gateway (turns resolve
//! to no payloads).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchboard_core::agent::{AgentTurnDriver, AgentTurnRequest, DEFAULT_TURN_TIMEOUT_SECS};
use switchboard_core::config::AgentBackendConfig;
use switchboard_core::types::MessagePayload;
use switchboard_core::{CoreError, Result};

pub struct HttpAgentDriver {
    client: reqwest::Client,
    endpoint: Option<String>,
    default_model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TurnResponse {
    #[serde(default)]
    payloads: Vec<MessagePayload>,
}

impl HttpAgentDriver {
    pub fn new(cfg: &AgentBackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: cfg.endpoint.clone(),
            default_model: cfg.model.clone(),
        }
    }
}

#[async_trait]
impl AgentTurnDriver for HttpAgentDriver {
    async fn run_turn(
        &self,
        request: AgentTurnRequest,
        abort: CancellationToken,
    ) -> Result<Vec<MessagePayload>> {
        let Some(endpoint) = &self.endpoint else {
            debug!(session = %request.session_key, "no agent backend configured, turn resolves empty");
            return Ok(Vec::new());
        };

        let timeout = Duration::from_secs(
            request.timeout_seconds.unwrap_or(DEFAULT_TURN_TIMEOUT_SECS),
        );
        let body = json!({
            "agentId": request.agent_id.as_str(),
            "sessionKey": request.session_key,
            "message": request.message,
            "model": request.model.as_deref().or(self.default_model.as_deref()),
            "thinking": request.thinking,
            "allowUnsafeExternalContent": request.allow_unsafe_external_content,
            "internalOnly": request.internal_only,
        });

        let send = self.client.post(endpoint).timeout(timeout).json(&body).send();

        let response = tokio::select! {
            result = send => result.map_err(|e| CoreError::AgentTurn(e.to_string()))?,
            _ = abort.cancelled() => return Err(CoreError::Aborted),
        };

        let response = response
            .error_for_status()
            .map_err(|e| CoreError::AgentTurn(e.to_string()))?;
        let parsed: TurnResponse = response
            .json()
            .await
            .map_err(|e| CoreError::AgentTurn(format!("bad backend response: {e}")))?;

        if parsed.payloads.is_empty() {
            warn!(session = %body["sessionKey"], "agent backend returned no payloads");
        }
        Ok(parsed.payloads)
    }
}
