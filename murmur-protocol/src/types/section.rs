use serde::{Deserialize, Serialize};

use super::event::Event;

/// A run of adjacent events coalesced for display
///
/// `key` is the timestamp identifying the section; `data` is never empty
/// when built by the grouping engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSection {
    pub key: i64,
    pub data: Vec<Event>,
}

impl EventSection {
    /// Start a section from a single event, keyed by its timestamp
    pub fn new(event: Event) -> Self {
        Self {
            key: event.timestamp(),
            data: vec![event],
        }
    }

    pub fn first(&self) -> Option<&Event> {
        self.data.first()
    }

    pub fn last(&self) -> Option<&Event> {
        self.data.last()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn event_ids(&self) -> Vec<&str> {
        self.data.iter().map(|e| e.event_id.as_str()).collect()
    }
}
