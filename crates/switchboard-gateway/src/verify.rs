//! Webhook request authentication.
//!
//! Shared-secret channels use a constant-time comparison against a query or
//! header token. Voice/SMS providers use their documented signature schemes:
//! HMAC-SHA1 over URL + sorted params (Twilio), HMAC-SHA256 over URL + nonce
//! (Plivo V2) or base URL + nonce + sorted POST params (Plivo V3), and
//! Ed25519 over `timestamp|rawBody` (Telnyx).

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use switchboard_core::config::WebhookAuthConfig;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Constant-time equality. Length is not secret; unequal lengths return
/// false immediately.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Check the shared secret carried in query params or headers.
///
/// Accepted locations: `?guid=` / `?password=` query params, `X-Guid`,
/// `X-Password`, `X-BlueBubbles-Guid` headers, `Authorization: Bearer`.
pub fn verify_shared_secret(
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
    expected: &str,
) -> Result<(), String> {
    let candidates = [
        query.get("guid").map(String::as_str),
        query.get("password").map(String::as_str),
        header_str(headers, "x-guid"),
        header_str(headers, "x-password"),
        header_str(headers, "x-bluebubbles-guid"),
        header_str(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ")),
    ];

    let presented = candidates.into_iter().flatten().next();
    match presented {
        Some(token) if timing_safe_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        Some(_) => Err("shared secret mismatch".to_string()),
        None => Err("no shared secret presented".to_string()),
    }
}

/// Twilio: base64(HMAC-SHA1(token, url + concat(sorted k+v of POST params))),
/// compared against `X-Twilio-Signature`.
pub fn verify_twilio_signature(
    headers: &HeaderMap,
    url: &str,
    form_params: &BTreeMap<String, String>,
    auth_token: &str,
) -> Result<(), String> {
    let signature = header_str(headers, "x-twilio-signature")
        .ok_or_else(|| "missing X-Twilio-Signature".to_string())?;

    let mut canonical = url.to_string();
    for (key, value) in form_params {
        canonical.push_str(key);
        canonical.push_str(value);
    }

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(canonical.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    if timing_safe_eq(expected.as_bytes(), signature.as_bytes()) {
        Ok(())
    } else {
        Err("Twilio signature mismatch".to_string())
    }
}

/// Plivo V2: base64(HMAC-SHA256(token, url + nonce)) against
/// `X-Plivo-Signature-V2` with its nonce header.
pub fn verify_plivo_v2_signature(
    headers: &HeaderMap,
    url: &str,
    auth_token: &str,
) -> Result<(), String> {
    let signature = header_str(headers, "x-plivo-signature-v2")
        .ok_or_else(|| "missing X-Plivo-Signature-V2".to_string())?;
    let nonce = header_str(headers, "x-plivo-signature-v2-nonce")
        .ok_or_else(|| "missing X-Plivo-Signature-V2-Nonce".to_string())?;

    let mut mac = HmacSha256::new_from_slice(auth_token.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(url.as_bytes());
    mac.update(nonce.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    // The header may carry several comma-separated signatures after key
    // rotation; any match passes.
    if signature
        .split(',')
        .any(|sig| timing_safe_eq(expected.as_bytes(), sig.trim().as_bytes()))
    {
        Ok(())
    } else {
        Err("Plivo V2 signature mismatch".to_string())
    }
}

/// Plivo V3: HMAC-SHA256 over base URL + nonce + sorted `k=v` POST params.
pub fn verify_plivo_v3_signature(
    headers: &HeaderMap,
    base_url: &str,
    form_params: &BTreeMap<String, String>,
    auth_token: &str,
) -> Result<(), String> {
    let signature = header_str(headers, "x-plivo-signature-v3")
        .ok_or_else(|| "missing X-Plivo-Signature-V3".to_string())?;
    let nonce = header_str(headers, "x-plivo-signature-v3-nonce")
        .ok_or_else(|| "missing X-Plivo-Signature-V3-Nonce".to_string())?;

    let mut canonical = format!("{base_url}.{nonce}");
    let params: Vec<String> = form_params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    if !params.is_empty() {
        canonical.push('.');
        canonical.push_str(&params.join("&"));
    }

    let mut mac = HmacSha256::new_from_slice(auth_token.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(canonical.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    if signature
        .split(',')
        .any(|sig| timing_safe_eq(expected.as_bytes(), sig.trim().as_bytes()))
    {
        Ok(())
    } else {
        Err("Plivo V3 signature mismatch".to_string())
    }
}

/// Telnyx: Ed25519 over `timestamp|rawBody` with the account's public key.
pub fn verify_telnyx_signature(
    headers: &HeaderMap,
    raw_body: &[u8],
    public_key_b64: &str,
) -> Result<(), String> {
    let signature_b64 = header_str(headers, "telnyx-signature-ed25519")
        .ok_or_else(|| "missing telnyx-signature-ed25519".to_string())?;
    let timestamp = header_str(headers, "telnyx-timestamp")
        .ok_or_else(|| "missing telnyx-timestamp".to_string())?;

    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(public_key_b64)
        .map_err(|_| "public key is not valid base64".to_string())?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| "public key must be 32 bytes".to_string())?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| "invalid Ed25519 public key".to_string())?;

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|_| "signature is not valid base64".to_string())?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| "signature must be 64 bytes".to_string())?;
    let signature = Signature::from_bytes(&sig_bytes);

    let mut message = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'|');
    message.extend_from_slice(raw_body);

    key.verify(&message, &signature)
        .map_err(|_| "Telnyx signature mismatch".to_string())
}

/// Rebuild the externally visible URL for signature verification.
///
/// Forwarded headers participate only when the request arrived from a
/// trusted proxy IP and the forwarded host is allowlisted; otherwise the
/// locally observed values stand.
pub fn reconstruct_signed_url(
    auth: &WebhookAuthConfig,
    peer_ip: &str,
    headers: &HeaderMap,
    local_scheme: &str,
    local_host: &str,
    path_and_query: &str,
) -> String {
    let trusted = auth.trusted_proxies.iter().any(|p| p == peer_ip);
    let mut scheme = local_scheme.to_string();
    let mut host = local_host.to_string();

    if trusted {
        if let Some(fwd_proto) = header_str(headers, "x-forwarded-proto") {
            scheme = fwd_proto.split(',').next().unwrap_or(fwd_proto).trim().to_string();
        }
        if let Some(fwd_host) = header_str(headers, "x-forwarded-host") {
            let candidate = fwd_host.split(',').next().unwrap_or(fwd_host).trim();
            if auth
                .forwarded_host_allowlist
                .iter()
                .any(|h| h.eq_ignore_ascii_case(candidate))
            {
                host = candidate.to_string();
            }
        }
    }

    format!("{scheme}://{host}{path_and_query}")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
