//! Protocol client contract

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use murmur_protocol::{
    Content, Direction, Event, MessagePage, PublicRoom, Room, RoomNotification, SearchResponse,
    Session, UserProfile,
};
use murmur_utils::Result;

/// Shared handle to a protocol client
pub type SharedClient = Arc<dyn ProtocolClient>;

/// Operations the engine issues against the chat server.
///
/// Implementations report plain transport failures as
/// `MurmurError::Transport`; the engine re-labels them per operation.
/// Domain failures (`NotConnected`, `RoomNotFound`, `ListenerConflict`)
/// are reported as such and surface unchanged.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Exchange a username and password for a session
    async fn login(&self, server_url: &str, username: &str, password: &str) -> Result<Session>;

    /// Start a session and perform the initial sync
    async fn connect(&self, session: &Session) -> Result<UserProfile>;

    /// Tear down the running session
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Create a direct room inviting `user_id`
    async fn create_room(&self, user_id: &str) -> Result<Room>;

    async fn join_room(&self, room_id: &str) -> Result<Room>;

    async fn invited_rooms(&self) -> Result<Vec<Room>>;

    async fn joined_rooms(&self) -> Result<Vec<Room>>;

    /// Public room directory of a homeserver; needs no session
    async fn public_rooms(&self, server_url: &str) -> Result<Vec<PublicRoom>>;

    /// Register the single upstream listener for a room.
    ///
    /// Fails with `ListenerConflict` if the room is already listened to.
    async fn start_listening(&self, room_id: &str) -> Result<()>;

    /// Remove the upstream listener for a room. Idempotent.
    async fn stop_listening(&self, room_id: &str) -> Result<()>;

    /// Reset the backward pagination cursor of a room to its live end
    async fn reset_pagination(&self, room_id: &str) -> Result<()>;

    /// Page `limit` older events into the room's upstream listener.
    ///
    /// Events are delivered on the notification channel as
    /// [`Direction::Backwards`], newest first, before this call returns.
    async fn paginate_backwards(&self, room_id: &str, limit: usize) -> Result<()>;

    /// Fetch one chunk of messages starting at a cursor
    async fn get_messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<MessagePage>;

    /// Full-text search inside a room. `None` means no result set at all.
    async fn search(
        &self,
        room_id: &str,
        term: &str,
        next_batch: &str,
        before_limit: usize,
        after_limit: usize,
    ) -> Result<Option<SearchResponse>>;

    /// Send a message; returns the new event id
    async fn send_message(&self, room_id: &str, content: Content) -> Result<String>;

    async fn send_read_receipt(&self, room_id: &str, event_id: &str) -> Result<()>;

    /// Event types counted as unread by the session
    async fn unread_event_types(&self) -> Result<Vec<String>>;

    /// Most recent event per room, restricted to `event_types`
    async fn recent_events(&self, event_types: &[String]) -> Result<Vec<Vec<Event>>>;

    /// Subscribe to the shared event notification channel
    fn subscribe(&self) -> broadcast::Receiver<RoomNotification>;
}
