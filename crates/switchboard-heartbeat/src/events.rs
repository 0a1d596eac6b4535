use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use switchboard_core::types::now_ms;

/// Where a system event came from. The heartbeat's empty-file fast-path only
/// yields when no tagged cron/exec events are waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemEventKind {
    Cron,
    Exec,
    /// Gateway-internal notices (e.g. "Assistant sent […]").
    Notice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub kind: SystemEventKind,
    pub text: String,
    pub created_at: i64,
}

/// Per-session queue of system events awaiting the next agent turn.
pub struct SystemEventQueue {
    events: Mutex<HashMap<String, Vec<SystemEvent>>>,
}

impl SystemEventQueue {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, session_key: &str, kind: SystemEventKind, text: impl Into<String>) {
        let mut events = self.events.lock().expect("system event queue poisoned");
        events.entry(session_key.to_string()).or_default().push(SystemEvent {
            kind,
            text: text.into(),
            created_at: now_ms(),
        });
    }

    /// Any cron/exec events waiting for this session?
    pub fn has_tagged_pending(&self, session_key: &str) -> bool {
        let events = self.events.lock().expect("system event queue poisoned");
        events
            .get(session_key)
            .map(|v| {
                v.iter()
                    .any(|e| matches!(e.kind, SystemEventKind::Cron | SystemEventKind::Exec))
            })
            .unwrap_or(false)
    }

    /// Take all pending events for a session, oldest first.
    pub fn drain(&self, session_key: &str) -> Vec<SystemEvent> {
        let mut events = self.events.lock().expect("system event queue poisoned");
        events.remove(session_key).unwrap_or_default()
    }
}

impl Default for SystemEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_pending_ignores_notices() {
        let queue = SystemEventQueue::new();
        queue.enqueue("s1", SystemEventKind::Notice, "fyi");
        assert!(!queue.has_tagged_pending("s1"));
        queue.enqueue("s1", SystemEventKind::Cron, "job fired");
        assert!(queue.has_tagged_pending("s1"));
    }

    #[test]
    fn drain_empties_the_session() {
        let queue = SystemEventQueue::new();
        queue.enqueue("s1", SystemEventKind::Exec, "one");
        queue.enqueue("s1", SystemEventKind::Exec, "two");
        assert_eq!(queue.drain("s1").len(), 2);
        assert!(queue.drain("s1").is_empty());
    }
}
