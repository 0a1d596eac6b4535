//! Webhook ingress — POST /webhooks/{channel}/{account}.
//!
//! Verify → normalize → hand off to the inbound pipeline. Only signature and
//! validation failures produce 4xx; accepted payloads (including replays and
//! unsupported event types) always answer 200 so providers stop retrying.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use switchboard_core::config::{WebhookAuthConfig, WebhookAuthMode};
use switchboard_core::types::{now_ms, InboundEvent, Message};

use crate::app::AppState;
use crate::replay::request_fingerprint;
use crate::verify;

/// POST /webhooks/{channel}/{account}
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path((channel, account_id)): Path<(String, String)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<BTreeMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(channel_cfg) = state.cfg.channel(&channel).cloned() else {
        warn!(channel = %channel, "webhook for unconfigured channel");
        return Err(unauthorized("unknown channel"));
    };
    let auth = &channel_cfg.webhook;

    // ── Verify ────────────────────────────────────────────────────────────────
    let url = verify::reconstruct_signed_url(
        auth,
        &peer.ip().to_string(),
        &headers,
        "https",
        headers
            .get("host")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost"),
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
    );
    let form = form_params(&headers, &body);

    let is_replay = match auth.mode {
        WebhookAuthMode::None => false,
        WebhookAuthMode::SharedSecret => {
            let secret = effective_secret(&channel_cfg, &account_id, auth);
            let Some(secret) = secret else {
                return Err(unauthorized("no secret configured"));
            };
            verify::verify_shared_secret(&headers, &query, &secret)
                .map_err(|e| auth_failure(&channel, &e))?;
            false
        }
        WebhookAuthMode::Twilio => {
            let secret = required_secret(auth, &channel)?;
            verify::verify_twilio_signature(&headers, &url, &form, &secret)
                .map_err(|e| auth_failure(&channel, &e))?;
            signed_replay(&state, &headers, "i-twilio-idempotency-token", &url, "x-twilio-signature", &body)
        }
        WebhookAuthMode::PlivoV2 => {
            let secret = required_secret(auth, &channel)?;
            verify::verify_plivo_v2_signature(&headers, &url, &secret)
                .map_err(|e| auth_failure(&channel, &e))?;
            signed_replay(&state, &headers, "x-plivo-idempotency-token", &url, "x-plivo-signature-v2", &body)
        }
        WebhookAuthMode::PlivoV3 => {
            let secret = required_secret(auth, &channel)?;
            let base_url = url.split('?').next().unwrap_or(&url).to_string();
            verify::verify_plivo_v3_signature(&headers, &base_url, &form, &secret)
                .map_err(|e| auth_failure(&channel, &e))?;
            signed_replay(&state, &headers, "x-plivo-idempotency-token", &url, "x-plivo-signature-v3", &body)
        }
        WebhookAuthMode::Telnyx => {
            let Some(public_key) = auth.public_key.as_deref() else {
                return Err(unauthorized("no telnyx public key configured"));
            };
            verify::verify_telnyx_signature(&headers, &body, public_key)
                .map_err(|e| auth_failure(&channel, &e))?;
            let timestamp = headers
                .get("telnyx-timestamp")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let fp = request_fingerprint(
                header(&headers, "x-telnyx-event-id").as_deref(),
                timestamp,
                &header(&headers, "telnyx-signature-ed25519").unwrap_or_default(),
                &body,
            );
            state.replay.check_and_remember(&fp)
        }
    };

    if is_replay {
        info!(channel = %channel, "verified webhook replay suppressed");
        return Ok(Json(json!({ "ok": true, "replay": true })));
    }

    // ── Normalize ─────────────────────────────────────────────────────────────
    let event = match normalize(&channel, &form, &body) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(Json(json!({ "ok": true, "ignored": true }))),
        Err(reason) => {
            warn!(channel = %channel, reason = %reason, "invalid webhook payload");
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid payload", "reason": reason })),
            ));
        }
    };

    // ── Process ───────────────────────────────────────────────────────────────
    // Pipeline errors never surface to the provider: the payload was
    // accepted, the failure is ours to log and retry.
    match state.pipeline.handle_event(&channel, &account_id, event).await {
        Ok(actions) => state.execute_actions(actions).await,
        Err(e) => warn!(channel = %channel, error = %e, "inbound processing failed"),
    }

    Ok(Json(json!({ "ok": true })))
}

fn normalize(
    channel: &str,
    form: &BTreeMap<String, String>,
    body: &Bytes,
) -> Result<Option<InboundEvent>, String> {
    match channel {
        "bluebubbles" => switchboard_inbound::bluebubbles::parse_webhook(body)
            .map_err(|e| e.to_string()),
        // Form-encoded SMS providers share one minimal shape.
        "twilio" | "plivo" | "telnyx-sms" if !form.is_empty() => Ok(sms_message(form)),
        _ => match serde_json::from_slice::<InboundEvent>(body) {
            Ok(event) => Ok(Some(event)),
            Err(e) if is_unknown_tag(&e) => Ok(None),
            Err(e) => Err(e.to_string()),
        },
    }
}

/// Twilio/Plivo-style form posts normalize to a bare direct message.
fn sms_message(form: &BTreeMap<String, String>) -> Option<InboundEvent> {
    let text = form.get("Body").or_else(|| form.get("Text"))?.clone();
    let sender = form.get("From")?.clone();
    let message_id = form
        .get("MessageSid")
        .or_else(|| form.get("MessageUUID"))
        .cloned()
        .unwrap_or_default();

    let mut message = Message {
        message_id,
        sender_id: sender,
        text,
        timestamp: now_ms(),
        ..Default::default()
    };
    message.chat.chat_id = form.get("To").cloned();
    Some(InboundEvent::NewMessage { data: message })
}

fn is_unknown_tag(e: &serde_json::Error) -> bool {
    let text = e.to_string();
    text.contains("unknown variant") || text.contains("missing field `type`")
}

fn form_params(headers: &HeaderMap, body: &Bytes) -> BTreeMap<String, String> {
    let is_form = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if !is_form {
        return BTreeMap::new();
    }
    serde_urlencoded_parse(body)
}

// Minimal urlencoded parsing; bodies are small (1 MiB cap upstream).
fn serde_urlencoded_parse(body: &Bytes) -> BTreeMap<String, String> {
    let text = String::from_utf8_lossy(body);
    text.split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((url_decode(k), url_decode(v)))
        })
        .collect()
}

fn url_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

fn effective_secret(
    channel_cfg: &switchboard_core::config::ChannelConfig,
    account_id: &str,
    auth: &WebhookAuthConfig,
) -> Option<String> {
    channel_cfg
        .accounts
        .get(account_id)
        .and_then(|a| a.webhook_secret.clone())
        .or_else(|| auth.secret.clone())
}

fn required_secret(
    auth: &WebhookAuthConfig,
    channel: &str,
) -> Result<String, (StatusCode, Json<Value>)> {
    auth.secret.clone().ok_or_else(|| {
        warn!(channel = %channel, "signed webhook without configured secret");
        unauthorized("no signing secret configured")
    })
}

fn signed_replay(
    state: &AppState,
    headers: &HeaderMap,
    token_header: &str,
    url: &str,
    signature_header: &str,
    body: &Bytes,
) -> bool {
    let fp = request_fingerprint(
        header(headers, token_header).as_deref(),
        url,
        &header(headers, signature_header).unwrap_or_default(),
        body,
    );
    state.replay.check_and_remember(&fp)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn unauthorized(reason: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized", "reason": reason })),
    )
}

fn auth_failure(channel: &str, reason: &str) -> (StatusCode, Json<Value>) {
    // Mask anything that looks like a token before it reaches the log line.
    warn!(channel = %channel, reason = %reason, "webhook authentication failed");
    unauthorized(reason)
}
