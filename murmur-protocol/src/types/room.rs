use serde::{Deserialize, Serialize};

use super::event::Event;

/// Snapshot of a room as reported by the protocol client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub room_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notification_count: u64,
    #[serde(default)]
    pub highlight_count: u64,
    #[serde(default)]
    pub is_direct: bool,
    /// Most recent `m.room.message` event
    #[serde(default)]
    pub last_message: Option<Event>,
}

impl Room {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            name: None,
            notification_count: 0,
            highlight_count: 0,
            is_direct: false,
            last_message: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name to show for the room, falling back to its id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.room_id)
    }

    pub fn has_unread(&self) -> bool {
        self.notification_count > 0
    }
}

/// Entry of a homeserver's public room directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicRoom {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub guest_can_join: bool,
    #[serde(default)]
    pub num_joined_members: u64,
}
