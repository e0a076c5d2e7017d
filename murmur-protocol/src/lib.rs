//! murmur-protocol: Value types shared with the chat protocol client
//!
//! This crate defines the data model (sessions, rooms, events, display
//! sections) and the payloads carried across the boundary between the
//! murmur engine and the protocol client that talks to the homeserver.

pub mod messages;
pub mod types;

// Re-export main types at crate root
pub use messages::{
    ContextToken, HitContext, MessagePage, RoomNotification, SearchHit, SearchResponse,
    SearchResult,
};
pub use types::{
    now_millis, Content, Direction, Event, EventSection, PublicRoom, Room, Session, UserProfile,
    MSGTYPE_TEXT, ROOM_MESSAGE,
};
