//! Per-room façade over listeners, history and messaging

use murmur_protocol::{Content, Direction, Room};
use murmur_utils::Result;

use crate::connection::{EventHandler, SharedClient};
use crate::history::{HistoryLoader, HistoryPage};
use crate::listeners::{ListenerHandle, RoomListenerMux, RoomSubscription};
use crate::session::{text_content, ConnectionGate};

pub struct RoomTimeline {
    room: Room,
    client: SharedClient,
    gate: ConnectionGate,
    listeners: RoomListenerMux,
    history: HistoryLoader,
    page_size: usize,
}

impl RoomTimeline {
    pub(crate) fn new(
        room: Room,
        client: SharedClient,
        gate: ConnectionGate,
        listeners: RoomListenerMux,
        history: HistoryLoader,
        page_size: usize,
    ) -> Self {
        Self {
            room,
            client,
            gate,
            listeners,
            history,
            page_size,
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn room_id(&self) -> &str {
        &self.room.room_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Invoke `handler` for each live event of this room
    pub async fn on_new_message<H>(&self, handler: H) -> Result<ListenerHandle>
    where
        H: EventHandler + 'static,
    {
        self.listeners
            .on_event(self.room_id(), Direction::Forwards, handler)
            .await
    }

    /// Live events of this room, pull style
    pub async fn live(&self) -> Result<RoomSubscription> {
        self.listeners
            .add_listener(self.room_id(), Direction::Forwards)
            .await
    }

    /// Register the backward listener history loads depend on.
    ///
    /// Keep the subscription alive for as long as `backwards` is used.
    pub async fn listen_backwards(&self) -> Result<RoomSubscription> {
        self.listeners
            .add_listener(self.room_id(), Direction::Backwards)
            .await
    }

    /// Load the next page of history using the configured page size
    pub async fn backwards(&self, initial_load: bool) -> Result<HistoryPage> {
        self.backwards_with(self.page_size, initial_load).await
    }

    pub async fn backwards_with(&self, per_page: usize, initial_load: bool) -> Result<HistoryPage> {
        self.history
            .load_backwards(self.room_id(), per_page, initial_load)
            .await
    }

    pub async fn send_message(&self, content: Content) -> Result<String> {
        self.gate.ensure_connected()?;
        self.client.send_message(self.room_id(), content).await
    }

    pub async fn send_text(&self, body: &str) -> Result<String> {
        self.send_message(text_content(body)).await
    }

    pub async fn send_read_receipt(&self, event_id: &str) -> Result<()> {
        self.gate.ensure_connected()?;
        self.client.send_read_receipt(self.room_id(), event_id).await
    }
}
