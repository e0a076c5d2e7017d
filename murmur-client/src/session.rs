//! Session lifecycle
//!
//! `Disconnected -> Connecting -> Connected`. Every room and event
//! operation checks the shared [`ConnectionGate`] and fails with
//! `NotConnected` outside the `Connected` state.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use murmur_protocol::{
    now_millis, Content, Event, PublicRoom, Room, Session, UserProfile, MSGTYPE_TEXT,
};
use murmur_utils::{MurmurError, Result};

use crate::config::ClientConfig;
use crate::connection::SharedClient;
use crate::history::HistoryLoader;
use crate::listeners::RoomListenerMux;
use crate::search::SearchContext;
use crate::sections::EventStream;
use crate::timeline::RoomTimeline;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Read side of the connection state, shared by every component
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionGate {
    fn new(state: watch::Receiver<ConnectionState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Fail with `NotConnected` unless a session is live
    pub fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MurmurError::NotConnected)
        }
    }
}

/// An invited room that could not be joined
#[derive(Debug)]
pub struct JoinFailure {
    pub room_id: String,
    pub error: MurmurError,
}

/// Outcome of joining every invited room after connecting
#[derive(Debug, Default)]
pub struct AutoJoinReport {
    pub joined: Vec<Room>,
    pub failed: Vec<JoinFailure>,
    /// Set when the invited room list itself could not be fetched
    pub listing_error: Option<MurmurError>,
}

impl AutoJoinReport {
    /// Every invited room was joined
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.listing_error.is_none()
    }
}

/// Result of a successful `connect`
#[derive(Debug)]
pub struct Connected {
    pub profile: UserProfile,
    /// `None` when auto-join is disabled in the configuration
    pub auto_join: Option<AutoJoinReport>,
}

/// Top-level entry point: owns the connection state and composes the
/// listener multiplexer, history loader and search contexts.
pub struct SessionManager {
    client: SharedClient,
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    gate: ConnectionGate,
    session: Mutex<Option<Session>>,
    profile: Mutex<Option<UserProfile>>,
    listeners: RoomListenerMux,
    history: HistoryLoader,
}

impl SessionManager {
    pub fn new(client: SharedClient) -> Self {
        Self::with_config(client, ClientConfig::default())
    }

    pub fn with_config(client: SharedClient, config: ClientConfig) -> Self {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let gate = ConnectionGate::new(state_rx);
        let listeners = RoomListenerMux::new(client.clone(), gate.clone());
        let history = HistoryLoader::new(client.clone(), listeners.clone(), gate.clone());

        Self {
            client,
            config,
            state,
            gate,
            session: Mutex::new(None),
            profile: Mutex::new(None),
            listeners,
            history,
        }
    }

    // ==================== State ====================

    pub fn state(&self) -> ConnectionState {
        self.gate.state()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The live session, if connected
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.profile.lock().clone()
    }

    pub fn listeners(&self) -> &RoomListenerMux {
        &self.listeners
    }

    pub fn history(&self) -> &HistoryLoader {
        &self.history
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "connection state changed");
        }
    }

    // ==================== Lifecycle ====================

    /// Exchange credentials for a session. Does not change state.
    pub async fn login(&self, server_url: &str, username: &str, password: &str) -> Result<Session> {
        Url::parse(server_url).map_err(|e| {
            MurmurError::InvalidCredentials(format!("invalid homeserver URL '{}': {}", server_url, e))
        })?;
        if username.is_empty() || password.is_empty() {
            return Err(MurmurError::InvalidCredentials(
                "username and password are required".into(),
            ));
        }

        let session = self
            .client
            .login(server_url, username, password)
            .await
            .map_err(MurmurError::into_auth)?;

        info!(user_id = %session.user_id, "logged in");
        Ok(session)
    }

    /// Start a session; joins invited rooms when auto-join is enabled.
    ///
    /// Join failures are collected in the report and never fail the connect.
    pub async fn connect(&self, session: Session) -> Result<Connected> {
        if !session.is_complete() {
            return Err(MurmurError::InvalidCredentials(
                "session needs a homeserver, user id and access token".into(),
            ));
        }

        self.transition(ConnectionState::Connecting);
        info!(user_id = %session.user_id, home_server = %session.home_server, "connecting");
        // Listeners of a previous session have no upstream in the new one
        self.listeners.reset().await;

        let profile = match self.client.connect(&session).await {
            Ok(profile) => profile,
            Err(e) => {
                self.session.lock().take();
                self.profile.lock().take();
                self.transition(ConnectionState::Disconnected);
                warn!(error = %e, "connect failed");
                return Err(e.into_connect());
            }
        };

        *self.session.lock() = Some(session);
        *self.profile.lock() = Some(profile.clone());
        self.transition(ConnectionState::Connected);
        info!(user_id = %profile.id, "connected");

        let auto_join = if self.config.session.auto_join_invites {
            Some(self.auto_join().await)
        } else {
            None
        };

        Ok(Connected { profile, auto_join })
    }

    /// Join every invited room in list order, each independently
    pub async fn auto_join(&self) -> AutoJoinReport {
        let mut report = AutoJoinReport::default();

        let invited = match self.invited_rooms().await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(error = %e, "could not list invited rooms");
                report.listing_error = Some(e);
                return report;
            }
        };

        for room in invited {
            match self.client.join_room(&room.room_id).await {
                Ok(joined) => {
                    info!(room_id = %joined.room_id, "joined invited room");
                    report.joined.push(joined);
                }
                Err(error) => {
                    warn!(room_id = %room.room_id, error = %error, "failed to join invited room");
                    report.failed.push(JoinFailure {
                        room_id: room.room_id,
                        error,
                    });
                }
            }
        }

        report
    }

    /// End the session. The state is `Disconnected` afterwards even if the
    /// protocol client reports an error.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.client.disconnect().await;
        self.listeners.reset().await;
        self.session.lock().take();
        self.profile.lock().take();
        self.transition(ConnectionState::Disconnected);
        info!("disconnected");
        result
    }

    // ==================== Rooms ====================

    /// Create a direct room with `user_id`
    pub async fn create_room(&self, user_id: &str) -> Result<Room> {
        self.gate.ensure_connected()?;
        self.client.create_room(user_id).await
    }

    pub async fn join_room(&self, room_id: &str) -> Result<Room> {
        self.gate.ensure_connected()?;
        self.client.join_room(room_id).await
    }

    pub async fn invited_rooms(&self) -> Result<Vec<Room>> {
        self.gate.ensure_connected()?;
        self.client.invited_rooms().await
    }

    pub async fn joined_rooms(&self) -> Result<Vec<Room>> {
        self.gate.ensure_connected()?;
        self.client.joined_rooms().await
    }

    /// Public room directory of `server_url`; needs no session
    pub async fn public_rooms(&self, server_url: &str) -> Result<Vec<PublicRoom>> {
        Url::parse(server_url).map_err(|e| {
            MurmurError::InvalidCredentials(format!("invalid homeserver URL '{}': {}", server_url, e))
        })?;
        self.client.public_rooms(server_url).await
    }

    // ==================== Events ====================

    pub async fn send_message(&self, room_id: &str, content: Content) -> Result<String> {
        self.gate.ensure_connected()?;
        self.client.send_message(room_id, content).await
    }

    /// Send a plain `m.text` message
    pub async fn send_text(&self, room_id: &str, body: &str) -> Result<String> {
        self.send_message(room_id, text_content(body)).await
    }

    pub async fn send_read_receipt(&self, room_id: &str, event_id: &str) -> Result<()> {
        self.gate.ensure_connected()?;
        self.client.send_read_receipt(room_id, event_id).await
    }

    pub async fn unread_event_types(&self) -> Result<Vec<String>> {
        self.gate.ensure_connected()?;
        self.client.unread_event_types().await
    }

    /// Most recent events per room of the given types, stamped with `created_at`
    pub async fn recent_events(&self, event_types: &[String]) -> Result<Vec<Vec<Event>>> {
        self.gate.ensure_connected()?;
        let mut recent = self.client.recent_events(event_types).await?;
        let now = now_millis();
        for event in recent.iter_mut().flatten() {
            event.stamp_created_at(now);
        }
        Ok(recent)
    }

    // ==================== Per-room views ====================

    pub fn timeline(&self, room: &Room) -> RoomTimeline {
        RoomTimeline::new(
            room.clone(),
            self.client.clone(),
            self.gate.clone(),
            self.listeners.clone(),
            self.history.clone(),
            self.config.timeline.page_size,
        )
    }

    /// Fresh search context for one search term in `room_id`
    pub fn searcher(&self, room_id: &str) -> SearchContext {
        SearchContext::new(self.client.clone(), self.gate.clone(), room_id)
            .with_page_limit(self.config.search.limit)
    }

    /// Empty section list using the configured debounce duration
    pub fn event_stream(&self) -> EventStream {
        EventStream::with_debounce(self.config.timeline.debounce_ms)
    }
}

/// `{msgtype: m.text, body}` message content
pub fn text_content(body: &str) -> Content {
    let mut content = Content::new();
    content.insert("msgtype".into(), MSGTYPE_TEXT.into());
    content.insert("body".into(), body.into());
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClient;
    use crate::testing::{connected_manager, text_event, HOMESERVER};
    use murmur_protocol::Direction;
    use std::sync::Arc;

    const ROOM: &str = "!room:murmur.local";

    fn manager() -> (Arc<MemoryClient>, SessionManager) {
        let client = Arc::new(MemoryClient::new());
        client.register_user("alice", "hunter2");
        let manager = SessionManager::new(client.clone());
        (client, manager)
    }

    // ==================== Login Tests ====================

    #[tokio::test]
    async fn test_login_returns_session() {
        let (_client, manager) = manager();

        let session = manager.login(HOMESERVER, "alice", "hunter2").await.unwrap();
        assert_eq!(session.user_id, "@alice:murmur.local");
        assert_eq!(session.home_server, HOMESERVER);
        assert!(session.is_complete());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_login_wrong_password_is_auth_error() {
        let (_client, manager) = manager();

        let result = manager.login(HOMESERVER, "alice", "wrong").await;
        assert!(matches!(result, Err(MurmurError::Auth(_))));
    }

    #[tokio::test]
    async fn test_login_rejects_bad_input() {
        let (_client, manager) = manager();

        let result = manager.login("not a url", "alice", "hunter2").await;
        assert!(matches!(result, Err(MurmurError::InvalidCredentials(_))));

        let result = manager.login(HOMESERVER, "", "hunter2").await;
        assert!(matches!(result, Err(MurmurError::InvalidCredentials(_))));
    }

    // ==================== Connect Tests ====================

    #[tokio::test]
    async fn test_connect_transitions_to_connected() {
        let (_client, manager) = manager();
        let mut states = manager.watch_state();

        let session = manager.login(HOMESERVER, "alice", "hunter2").await.unwrap();
        let connected = manager.connect(session.clone()).await.unwrap();

        assert_eq!(connected.profile.id, "@alice:murmur.local");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.session(), Some(session));
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_reverts_to_disconnected() {
        let (_client, manager) = manager();

        let bogus = Session::new(HOMESERVER, "@alice:murmur.local", "not-a-token");
        let result = manager.connect(bogus).await;

        assert!(matches!(result, Err(MurmurError::Connect(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.session().is_none());
    }

    #[tokio::test]
    async fn test_connect_incomplete_session() {
        let (_client, manager) = manager();

        let result = manager.connect(Session::new(HOMESERVER, "", "tok")).await;
        assert!(matches!(result, Err(MurmurError::InvalidCredentials(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (_client, manager) = connected_manager().await;

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.profile().is_none());

        let result = manager.joined_rooms().await;
        assert!(matches!(result, Err(MurmurError::NotConnected)));
    }

    // ==================== Reconnect Tests ====================

    #[tokio::test]
    async fn test_reconnect_restarts_upstream_listeners() {
        let (client, manager) = connected_manager().await;
        client.add_joined_room(ROOM, "Room");
        let mut old = manager
            .listeners()
            .add_listener(ROOM, Direction::Forwards)
            .await
            .unwrap();

        manager.disconnect().await.unwrap();
        assert!(!manager.listeners().has_listener(ROOM, Direction::Forwards).await);
        assert!(old.is_stale());
        assert!(old.recv().await.is_none());

        let session = manager.login(HOMESERVER, "alice", "hunter2").await.unwrap();
        manager.connect(session).await.unwrap();
        let mut fresh = manager
            .listeners()
            .add_listener(ROOM, Direction::Forwards)
            .await
            .unwrap();
        assert_eq!(client.start_calls(), 2);
        assert!(client.is_listening(ROOM));

        assert!(client.deliver_live(ROOM, text_event("$live", ROOM, 0)));
        let event = fresh.recv().await.unwrap();
        assert_eq!(event.event_id, "$live");

        // Releasing a listener from the old session leaves the new one alone
        old.remove().await.unwrap();
        assert_eq!(manager.listeners().listener_count(ROOM).await, 1);
        assert_eq!(client.stop_calls(), 0);
        assert!(client.is_listening(ROOM));
    }

    #[tokio::test]
    async fn test_failed_reconnect_clears_listeners() {
        let (client, manager) = connected_manager().await;
        client.add_joined_room(ROOM, "Room");
        let _old = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();

        let bogus = Session::new(HOMESERVER, "@alice:murmur.local", "not-a-token");
        assert!(manager.connect(bogus).await.is_err());
        assert!(manager.listeners().active_rooms().await.is_empty());

        let session = manager.login(HOMESERVER, "alice", "hunter2").await.unwrap();
        manager.connect(session).await.unwrap();
        let _fresh = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();
        assert_eq!(client.start_calls(), 2);
    }

    // ==================== Auto-join Tests ====================

    #[tokio::test]
    async fn test_auto_join_collects_partial_failure() {
        let (client, manager) = manager();
        client.invite("!one:murmur.local", "One");
        client.invite("!two:murmur.local", "Two");
        client.invite("!three:murmur.local", "Three");
        client.fail_join("!two:murmur.local", "M_FORBIDDEN: banned");

        let session = manager.login(HOMESERVER, "alice", "hunter2").await.unwrap();
        let connected = manager.connect(session).await.unwrap();

        assert_eq!(connected.profile.id, "@alice:murmur.local");
        let report = connected.auto_join.unwrap();
        let joined: Vec<&str> = report.joined.iter().map(|r| r.room_id.as_str()).collect();
        assert_eq!(joined, vec!["!one:murmur.local", "!three:murmur.local"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].room_id, "!two:murmur.local");
        assert!(!report.is_complete());

        let joined_rooms = manager.joined_rooms().await.unwrap();
        assert_eq!(joined_rooms.len(), 2);
        assert_eq!(manager.invited_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_join_disabled() {
        let client = Arc::new(MemoryClient::new());
        client.register_user("alice", "hunter2");
        client.invite("!one:murmur.local", "One");

        let mut config = ClientConfig::default();
        config.session.auto_join_invites = false;
        let manager = SessionManager::with_config(client.clone(), config);

        let session = manager.login(HOMESERVER, "alice", "hunter2").await.unwrap();
        let connected = manager.connect(session).await.unwrap();

        assert!(connected.auto_join.is_none());
        assert!(manager.joined_rooms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_join_nothing_invited() {
        let (_client, manager) = connected_manager().await;
        let report = manager.auto_join().await;
        assert!(report.is_complete());
        assert!(report.joined.is_empty());
    }

    // ==================== Precondition Tests ====================

    #[tokio::test]
    async fn test_room_operations_require_connection() {
        let (client, manager) = manager();
        client.add_joined_room("!r:murmur.local", "Room");

        assert!(manager.create_room("@bob:x").await.unwrap_err().is_not_connected());
        assert!(manager.join_room("!r:murmur.local").await.unwrap_err().is_not_connected());
        assert!(manager.send_text("!r:murmur.local", "hi").await.unwrap_err().is_not_connected());
        assert!(manager
            .send_read_receipt("!r:murmur.local", "$1")
            .await
            .unwrap_err()
            .is_not_connected());
        assert!(manager.unread_event_types().await.unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn test_public_rooms_without_session() {
        let (client, manager) = manager();
        client.add_public_room(PublicRoom {
            id: "!lobby:murmur.local".into(),
            aliases: vec!["#lobby:murmur.local".into()],
            name: "Lobby".into(),
            guest_can_join: true,
            num_joined_members: 3,
        });

        let rooms = manager.public_rooms(HOMESERVER).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "Lobby");
    }

    // ==================== Room Operation Tests ====================

    #[tokio::test]
    async fn test_create_direct_room() {
        let (_client, manager) = connected_manager().await;

        let room = manager.create_room("@bob:murmur.local").await.unwrap();
        assert!(room.is_direct);

        let joined = manager.joined_rooms().await.unwrap();
        assert!(joined.iter().any(|r| r.room_id == room.room_id));
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let (_client, manager) = connected_manager().await;
        let result = manager.join_room("!missing:murmur.local").await;
        assert!(matches!(result, Err(MurmurError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_send_text_and_read_receipt() {
        let (client, manager) = connected_manager().await;
        client.add_joined_room("!r:murmur.local", "Room");

        let event_id = manager.send_text("!r:murmur.local", "hello").await.unwrap();
        manager.send_read_receipt("!r:murmur.local", &event_id).await.unwrap();

        assert_eq!(client.read_receipt("!r:murmur.local"), Some(event_id));
        let room = &manager.joined_rooms().await.unwrap()[0];
        assert_eq!(room.last_message.as_ref().and_then(|e| e.body()), Some("hello"));
    }

    #[tokio::test]
    async fn test_recent_events_are_stamped() {
        let (client, manager) = connected_manager().await;
        client.add_joined_room("!r:murmur.local", "Room");
        client.seed_text("!r:murmur.local", "@bob:murmur.local", "old", now_millis() - 5_000);

        let recent = manager
            .recent_events(&["m.room.message".to_string()])
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0][0].created_at.is_some());

        let unread = manager.unread_event_types().await.unwrap();
        assert!(unread.contains(&"m.room.message".to_string()));
    }

    #[tokio::test]
    async fn test_event_stream_uses_configured_debounce() {
        let client = Arc::new(MemoryClient::new());
        let mut config = ClientConfig::default();
        config.timeline.debounce_ms = 5_000;
        let manager = SessionManager::with_config(client, config);

        assert_eq!(manager.event_stream().debounce_ms(), 5_000);
    }

    #[tokio::test]
    async fn test_searcher_uses_configured_limit() {
        let client = Arc::new(MemoryClient::new());
        let mut config = ClientConfig::default();
        config.search.limit = 4;
        let manager = SessionManager::with_config(client, config);

        let search = manager.searcher("!r:murmur.local");
        assert_eq!(search.page_limit(), 4);
        assert_eq!(search.room_id(), "!r:murmur.local");
    }
}
