//! Canonical inbound envelope handed to the agent.

use chrono::{TimeZone, Utc};

/// Fields of the canonical envelope. Short ids appear bracketed (`[12]`)
/// next to their full provider ids for token economy.
#[derive(Debug, Clone, Default)]
pub struct InboundEnvelope {
    pub from: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub body: String,
    pub reply_to_id: Option<String>,
    pub reply_to_id_full: Option<String>,
    pub message_sid: Option<String>,
    pub message_sid_full: Option<String>,
    pub was_mentioned: bool,
    pub command_authorized: bool,
    pub originating_channel: String,
    pub originating_to: String,
    /// Budgeted history snapshot, prepended when non-empty.
    pub history: Option<String>,
}

impl InboundEnvelope {
    /// Render the envelope in the fixed `Key: value` layout.
    pub fn format(&self) -> String {
        let mut out = String::new();

        if let Some(history) = self.history.as_deref().filter(|h| !h.is_empty()) {
            out.push_str("[Chat messages since your last reply]\n");
            out.push_str(history);
            out.push_str("\n\n");
        }

        out.push_str(&format!("From: {}\n", self.from));
        out.push_str(&format!("Timestamp: {}\n", iso_of(self.timestamp)));
        out.push_str(&format!("Body: {}\n", self.body));
        if let Some(v) = &self.reply_to_id {
            out.push_str(&format!("ReplyToId: {v}\n"));
        }
        if let Some(v) = &self.reply_to_id_full {
            out.push_str(&format!("ReplyToIdFull: {v}\n"));
        }
        if let Some(v) = &self.message_sid {
            out.push_str(&format!("MessageSid: {v}\n"));
        }
        if let Some(v) = &self.message_sid_full {
            out.push_str(&format!("MessageSidFull: {v}\n"));
        }
        out.push_str(&format!("WasMentioned: {}\n", self.was_mentioned));
        out.push_str(&format!("CommandAuthorized: {}\n", self.command_authorized));
        out.push_str(&format!("OriginatingChannel: {}\n", self.originating_channel));
        out.push_str(&format!("OriginatingTo: {}", self.originating_to));
        out
    }
}

fn iso_of(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}
