//! BlueBubbles (iMessage bridge) webhook normalizer — the exemplar provider.
//!
//! Raw webhook JSON is parsed into the channel-agnostic [`InboundEvent`].
//! Unknown event types normalize to `None` (the HTTP layer answers 200 OK
//! without processing); malformed payloads are an [`InboundError::InvalidPayload`].

use serde::Deserialize;

use switchboard_core::types::{
    Attachment, ChatIds, InboundEvent, Message, Reaction, ReactionAction,
};

use crate::error::{InboundError, Result};

/// iMessage group chats report style 43; one-to-one chats 45.
const CHAT_STYLE_GROUP: i64 = 43;

#[derive(Debug, Deserialize)]
struct BbWebhook {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbMessage {
    guid: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    date_created: Option<i64>,
    #[serde(default)]
    is_from_me: bool,
    #[serde(default)]
    handle: Option<BbHandle>,
    #[serde(default)]
    chats: Vec<BbChat>,
    #[serde(default)]
    attachments: Vec<BbAttachment>,
    #[serde(default)]
    thread_originator_guid: Option<String>,
    #[serde(default)]
    associated_message_guid: Option<String>,
    #[serde(default)]
    associated_message_type: Option<String>,
    #[serde(default)]
    balloon_bundle_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbHandle {
    address: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbChat {
    #[serde(default)]
    guid: Option<String>,
    #[serde(default)]
    chat_identifier: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    style: Option<i64>,
    #[serde(default)]
    participants: Vec<BbHandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbAttachment {
    #[serde(default)]
    guid: Option<String>,
    #[serde(default)]
    transfer_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    total_bytes: Option<u64>,
}

/// Parse a BlueBubbles webhook body.
///
/// Returns `Ok(None)` for recognised-but-unsupported event types (typing
/// indicators, chat renames) so the caller can 200 without side effects.
pub fn parse_webhook(body: &[u8]) -> Result<Option<InboundEvent>> {
    let webhook: BbWebhook = serde_json::from_slice(body)
        .map_err(|e| InboundError::InvalidPayload(format!("bluebubbles webhook: {e}")))?;

    match webhook.kind.as_str() {
        "new-message" | "updated-message" => {
            let raw: BbMessage = serde_json::from_value(webhook.data)
                .map_err(|e| InboundError::InvalidPayload(format!("bluebubbles message: {e}")))?;

            // Reaction tapbacks ride on updated-message events.
            if let Some(reaction) = reaction_of(&raw) {
                return Ok(Some(match webhook.kind.as_str() {
                    "new-message" => InboundEvent::MessageReaction { data: reaction },
                    _ => InboundEvent::Reaction { data: reaction },
                }));
            }

            let message = message_of(raw)?;
            Ok(Some(match webhook.kind.as_str() {
                "new-message" => InboundEvent::NewMessage { data: message },
                _ => InboundEvent::UpdatedMessage { data: message },
            }))
        }
        other => {
            tracing::debug!(kind = other, "unsupported bluebubbles event type");
            Ok(None)
        }
    }
}

fn message_of(raw: BbMessage) -> Result<Message> {
    let chat = raw.chats.first();
    let chat_ids = ChatIds {
        chat_guid: chat.and_then(|c| c.guid.clone()),
        chat_identifier: chat.and_then(|c| c.chat_identifier.clone()),
        chat_id: None,
    };

    let message = Message {
        message_id: raw.guid,
        sender_id: raw
            .handle
            .as_ref()
            .map(|h| h.address.clone())
            .unwrap_or_default(),
        sender_name: raw.handle.as_ref().and_then(|h| h.display_name.clone()),
        is_group: is_group_chat(chat, &chat_ids),
        chat_name: chat.and_then(|c| c.display_name.clone()),
        chat: chat_ids,
        timestamp: raw.date_created.unwrap_or_default(),
        text: raw.text.unwrap_or_default(),
        attachments: raw
            .attachments
            .into_iter()
            .map(|a| Attachment {
                id: a.guid,
                name: a.transfer_name,
                mime_type: a.mime_type,
                url: None,
                local_path: None,
                total_bytes: a.total_bytes,
            })
            .collect(),
        participants: chat
            .map(|c| c.participants.iter().map(|p| p.address.clone()).collect())
            .unwrap_or_default(),
        reply_to_id: raw.thread_originator_guid,
        reply_to_body: None,
        reply_to_sender: None,
        balloon_bundle_id: raw.balloon_bundle_id,
        associated_message_guid: raw.associated_message_guid,
        from_me: raw.is_from_me,
    };

    if !message.has_dedup_identity() {
        return Err(InboundError::InvalidPayload(
            "message lacks dedup identity (no guid, no sender/body/timestamp)".to_string(),
        ));
    }
    Ok(message)
}

fn reaction_of(raw: &BbMessage) -> Option<Reaction> {
    let kind = raw.associated_message_type.as_deref()?;
    let (action, name) = match kind.strip_prefix('-') {
        Some(rest) => (ReactionAction::Removed, rest),
        None => (ReactionAction::Added, kind),
    };
    let emoji = tapback_emoji(name)?;

    let chat = raw.chats.first();
    Some(Reaction {
        message_id: raw
            .associated_message_guid
            .clone()
            .unwrap_or_else(|| raw.guid.clone()),
        sender_id: raw
            .handle
            .as_ref()
            .map(|h| h.address.clone())
            .unwrap_or_default(),
        emoji: emoji.to_string(),
        action,
        is_group: chat.and_then(|c| c.style) == Some(CHAT_STYLE_GROUP),
        chat: ChatIds {
            chat_guid: chat.and_then(|c| c.guid.clone()),
            chat_identifier: chat.and_then(|c| c.chat_identifier.clone()),
            chat_id: None,
        },
        timestamp: raw.date_created.unwrap_or_default(),
        from_me: raw.is_from_me,
    })
}

fn tapback_emoji(name: &str) -> Option<&'static str> {
    match name {
        "love" => Some("\u{2764}\u{fe0f}"),
        "like" => Some("\u{1f44d}"),
        "dislike" => Some("\u{1f44e}"),
        "laugh" => Some("\u{1f602}"),
        "emphasize" => Some("\u{203c}\u{fe0f}"),
        "question" => Some("\u{2753}"),
        _ => None,
    }
}

fn is_group_chat(chat: Option<&BbChat>, ids: &ChatIds) -> bool {
    if let Some(style) = chat.and_then(|c| c.style) {
        return style == CHAT_STYLE_GROUP;
    }
    ids.chat_guid
        .as_deref()
        .map(|g| g.contains(";+;"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_normalizes() {
        let body = serde_json::json!({
            "type": "new-message",
            "data": {
                "guid": "p:0/ABC-123",
                "text": "hello there",
                "dateCreated": 1700000000000i64,
                "isFromMe": false,
                "handle": {"address": "+15550001111", "displayName": "Alice"},
                "chats": [{
                    "guid": "iMessage;-;+15550001111",
                    "chatIdentifier": "+15550001111",
                    "style": 45
                }]
            }
        });
        let event = parse_webhook(body.to_string().as_bytes()).unwrap().unwrap();
        let InboundEvent::NewMessage { data } = event else {
            panic!("expected new-message");
        };
        assert_eq!(data.sender_id, "+15550001111");
        assert!(!data.is_group);
        assert_eq!(data.chat.chat_guid.as_deref(), Some("iMessage;-;+15550001111"));
    }

    #[test]
    fn group_style_detected() {
        let body = serde_json::json!({
            "type": "new-message",
            "data": {
                "guid": "g1",
                "text": "hi all",
                "dateCreated": 1i64,
                "handle": {"address": "+15550002222"},
                "chats": [{"guid": "iMessage;+;chat99", "style": 43}]
            }
        });
        let event = parse_webhook(body.to_string().as_bytes()).unwrap().unwrap();
        let InboundEvent::NewMessage { data } = event else {
            panic!()
        };
        assert!(data.is_group);
    }

    #[test]
    fn tapback_becomes_reaction() {
        let body = serde_json::json!({
            "type": "updated-message",
            "data": {
                "guid": "r1",
                "dateCreated": 2i64,
                "handle": {"address": "+15550001111"},
                "associatedMessageGuid": "p:0/ABC-123",
                "associatedMessageType": "love",
                "chats": [{"guid": "iMessage;-;+15550001111", "style": 45}]
            }
        });
        let event = parse_webhook(body.to_string().as_bytes()).unwrap().unwrap();
        let InboundEvent::Reaction { data } = event else {
            panic!("expected reaction");
        };
        assert_eq!(data.action, ReactionAction::Added);
        assert_eq!(data.message_id, "p:0/ABC-123");
    }

    #[test]
    fn removed_tapback_parses() {
        let body = serde_json::json!({
            "type": "updated-message",
            "data": {
                "guid": "r2",
                "dateCreated": 2i64,
                "handle": {"address": "+15550001111"},
                "associatedMessageGuid": "p:0/ABC-123",
                "associatedMessageType": "-like",
                "chats": []
            }
        });
        let event = parse_webhook(body.to_string().as_bytes()).unwrap().unwrap();
        let InboundEvent::Reaction { data } = event else {
            panic!()
        };
        assert_eq!(data.action, ReactionAction::Removed);
    }

    #[test]
    fn unknown_type_is_silently_skipped() {
        let body = br#"{"type": "typing-indicator", "data": {}}"#;
        assert!(parse_webhook(body).unwrap().is_none());
    }

    #[test]
    fn malformed_body_is_invalid_payload() {
        let err = parse_webhook(b"not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }
}
