use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque event payload
pub type Content = serde_json::Map<String, serde_json::Value>;

/// Event type of user-visible chat messages
pub const ROOM_MESSAGE: &str = "m.room.message";

/// Plain text message type
pub const MSGTYPE_TEXT: &str = "m.text";

/// Milliseconds since the Unix epoch, as observed locally
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ==================== Direction ====================

/// Direction of an event stream relative to the live end of a room
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// History, delivered newest to oldest
    Backwards,
    /// Live events, delivered oldest to newest
    Forwards,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Backwards => "backwards",
            Direction::Forwards => "forwards",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== Event ====================

/// A single protocol event (chat message, membership change, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub event_id: String,
    pub room_id: String,
    pub sender_id: String,
    /// Milliseconds since the server timestamp when the event was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
    /// Local wall-clock creation time, derived once from `age`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub content: Content,
    /// Set on the hit of a search result
    #[serde(default, rename = "match", skip_serializing_if = "std::ops::Not::not")]
    pub matched: bool,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        event_id: impl Into<String>,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: event_id.into(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            age: None,
            created_at: None,
            content: Content::new(),
            matched: false,
        }
    }

    /// Build an `m.room.message` event with the given msgtype and body
    pub fn message(
        event_id: impl Into<String>,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        msgtype: &str,
        body: &str,
    ) -> Self {
        let mut content = Content::new();
        content.insert("msgtype".into(), msgtype.into());
        content.insert("body".into(), body.into());
        Self::new(ROOM_MESSAGE, event_id, room_id, sender_id).with_content(content)
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    pub fn with_age(mut self, age: u64) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// `content.msgtype`, if present
    pub fn msgtype(&self) -> Option<&str> {
        self.content.get("msgtype").and_then(|v| v.as_str())
    }

    /// `content.body`, if present
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(|v| v.as_str())
    }

    /// Creation timestamp used for ordering and grouping (0 when never stamped)
    pub fn timestamp(&self) -> i64 {
        self.created_at.unwrap_or_default()
    }

    /// Derive `created_at` from `age` against the observation time `now`.
    ///
    /// A timestamp that is already set is left untouched.
    pub fn stamp_created_at(&mut self, now: i64) {
        if self.created_at.is_some() {
            return;
        }
        if let Some(age) = self.age {
            let age = i64::try_from(age).unwrap_or(i64::MAX);
            self.created_at = Some(now.saturating_sub(age));
        }
    }

    /// Owned variant of [`Event::stamp_created_at`]
    pub fn stamped(mut self, now: i64) -> Self {
        self.stamp_created_at(now);
        self
    }
}
