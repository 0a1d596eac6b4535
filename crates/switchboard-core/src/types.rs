use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies which agent a session, route, or cron job belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// The default single-agent setup uses "main".
    pub fn main() -> Self {
        Self("main".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The chat-identifier triad some providers expose. At least one field is
/// expected on any inbound group/chat event; providers that only know a bare
/// peer leave all three unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl ChatIds {
    /// First present identifier, lower-cased. Used as the dedup / session
    /// scoping token so the same chat always maps to the same key regardless
    /// of which identifier a given webhook carried.
    pub fn canonical(&self) -> Option<String> {
        self.chat_guid
            .as_deref()
            .or(self.chat_identifier.as_deref())
            .or(self.chat_id.as_deref())
            .map(|s| s.trim().to_lowercase())
    }

    /// True when any of the three identifiers matches any of `other`'s
    /// (case-insensitive). Used to correlate a provider echo with the
    /// outbound send that produced it.
    pub fn overlaps(&self, other: &ChatIds) -> bool {
        let mine: Vec<String> = [&self.chat_guid, &self.chat_identifier, &self.chat_id]
            .iter()
            .filter_map(|o| o.as_deref())
            .map(|s| s.to_lowercase())
            .collect();
        [&other.chat_guid, &other.chat_identifier, &other.chat_id]
            .iter()
            .filter_map(|o| o.as_deref())
            .any(|s| mine.iter().any(|m| m == &s.to_lowercase()))
    }

    pub fn is_empty(&self) -> bool {
        self.chat_guid.is_none() && self.chat_identifier.is_none() && self.chat_id.is_none()
    }
}

/// A single inbound attachment after provider parsing. The raw bytes are
/// fetched separately (subject to the per-account byte cap) and saved to the
/// media store; `local_path` is filled in at that point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

/// Normalized inbound message record. Every provider webhook parser emits
/// this shape; nothing downstream of normalization sees provider JSON.
///
/// Dedup invariant: at least one of `message_id` or
/// `(sender_id, text-or-attachments, timestamp)` is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(flatten)]
    pub chat: ChatIds,
    #[serde(default)]
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_sender: Option<String>,
    /// Rich-content balloon identifier (URL previews, stickers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balloon_bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associated_message_guid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
}

impl Message {
    /// True when the record satisfies the dedup invariant.
    pub fn has_dedup_identity(&self) -> bool {
        !self.message_id.trim().is_empty()
            || (!self.sender_id.trim().is_empty()
                && (!self.text.is_empty() || !self.attachments.is_empty())
                && self.timestamp > 0)
    }
}

/// Whether a reaction was applied or withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// Normalized inbound reaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: String,
    pub sender_id: String,
    pub emoji: String,
    pub action: ReactionAction,
    #[serde(default)]
    pub is_group: bool,
    #[serde(flatten)]
    pub chat: ChatIds,
    pub timestamp: i64,
    #[serde(default)]
    pub from_me: bool,
}

/// Tagged sum of everything a provider webhook can deliver. Unknown `type`
/// values are rejected at the decode boundary (the HTTP layer answers 200 OK
/// without further processing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundEvent {
    NewMessage { data: Message },
    UpdatedMessage { data: Message },
    MessageReaction { data: Reaction },
    Reaction { data: Reaction },
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage { .. } => "new-message",
            InboundEvent::UpdatedMessage { .. } => "updated-message",
            InboundEvent::MessageReaction { .. } => "message-reaction",
            InboundEvent::Reaction { .. } => "reaction",
        }
    }
}

/// One unit of agent output headed for a channel.
///
/// `text` may contain `MEDIA:<url>` sentinel lines which the outbound engine
/// folds into `media_urls` before chunking. Payloads flagged `is_reasoning`
/// carry model reasoning and are dropped before delivery unless a caller
/// (e.g. the heartbeat runner) opts in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub is_reasoning: bool,
    /// Channel-native rich content, interpreted only by the channel's own
    /// adapter (`send_payload`). Opaque to the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<serde_json::Value>,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.media_urls.is_empty() && self.channel_data.is_none()
    }
}

/// What a channel adapter reports back for one sent message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    /// Provider-assigned id of the sent message, when the provider returns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub to: String,
}

/// One line of conversation history surfaced to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub sender: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_ids_canonical_prefers_guid() {
        let chat = ChatIds {
            chat_guid: Some("iMessage;-;+15550001111".into()),
            chat_identifier: Some("other".into()),
            chat_id: None,
        };
        assert_eq!(chat.canonical().unwrap(), "imessage;-;+15550001111");
    }

    #[test]
    fn chat_ids_overlap_is_case_insensitive_across_fields() {
        let a = ChatIds {
            chat_guid: Some("ABC".into()),
            ..Default::default()
        };
        let b = ChatIds {
            chat_id: Some("abc".into()),
            chat_guid: None,
            chat_identifier: None,
        };
        assert!(a.overlaps(&b));

        let unrelated = ChatIds {
            chat_guid: Some("xyz".into()),
            ..Default::default()
        };
        assert!(!a.overlaps(&unrelated));
    }

    #[test]
    fn inbound_event_decodes_kebab_case_tag() {
        let raw = r#"{"type":"new-message","data":{"messageId":"m1","senderId":"alice","timestamp":1,"text":"hi"}}"#;
        let ev: InboundEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.kind(), "new-message");
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let raw = r#"{"type":"typing-indicator","data":{}}"#;
        assert!(serde_json::from_str::<InboundEvent>(raw).is_err());
    }

    #[test]
    fn dedup_identity_accepts_either_leg() {
        let with_id = Message {
            message_id: "m1".into(),
            ..Default::default()
        };
        assert!(with_id.has_dedup_identity());

        let with_triple = Message {
            sender_id: "alice".into(),
            text: "hello".into(),
            timestamp: 12,
            ..Default::default()
        };
        assert!(with_triple.has_dedup_identity());

        assert!(!Message::default().has_dedup_identity());
    }
}
