//! Payloads exchanged with the protocol client

use serde::{Deserialize, Serialize};

use crate::types::*;

// ==================== Notifications ====================

/// One item on the shared event notification channel
///
/// The channel is global per process; consumers filter by `room_id`
/// and `direction`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomNotification {
    pub room_id: String,
    pub direction: Direction,
    pub event: Event,
}

impl RoomNotification {
    pub fn new(direction: Direction, event: Event) -> Self {
        Self {
            room_id: event.room_id.clone(),
            direction,
            event,
        }
    }

    /// Does this notification belong to `room_id` flowing in `direction`?
    pub fn matches(&self, room_id: &str, direction: Direction) -> bool {
        self.direction == direction && self.room_id == room_id
    }
}

// ==================== Pagination ====================

/// A chunk of room messages plus the cursors bracketing it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessagePage {
    pub events: Vec<Event>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

// ==================== Search ====================

/// Events surrounding a search hit
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HitContext {
    #[serde(default)]
    pub before: Vec<Event>,
    #[serde(default)]
    pub after: Vec<Event>,
}

/// Pagination tokens around a search hit's context
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextToken {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// A single raw search hit as returned by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub event: Event,
    #[serde(default)]
    pub context: HitContext,
    #[serde(default)]
    pub token: ContextToken,
}

/// One page of server-side search results
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchHit>,
    #[serde(default)]
    pub next_batch: Option<String>,
    #[serde(default)]
    pub count: u64,
}

/// A search hit merged with its context into one time-ordered sequence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub events: Vec<Event>,
    pub token: ContextToken,
}

impl SearchResult {
    /// The matched event of this result
    pub fn hit(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.matched)
    }
}
