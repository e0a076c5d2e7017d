//! In-memory protocol client
//!
//! A self-contained homeserver stand-in implementing [`ProtocolClient`]:
//! accounts, rooms with an ordered timeline, a single upstream listener
//! per room, backward pagination through the notification channel,
//! cursor paging and substring search. Used for tests and offline demos.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use murmur_protocol::{
    now_millis, Content, ContextToken, Direction, Event, HitContext, MessagePage, PublicRoom, Room,
    RoomNotification, SearchHit, SearchResponse, Session, UserProfile, MSGTYPE_TEXT, ROOM_MESSAGE,
};
use murmur_utils::{MurmurError, Result};

use crate::config::ClientConfig;
use crate::connection::ProtocolClient;

/// Server name used for generated user and room ids
pub const SERVER_NAME: &str = "murmur.local";

const DEFAULT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Invited,
    Joined,
}

struct Account {
    password: String,
    user_id: String,
}

struct StoredEvent {
    event: Event,
    origin_ts: i64,
}

impl StoredEvent {
    /// The event as observed at `now`, with `age` filled in
    fn observed(&self, now: i64) -> Event {
        let mut event = self.event.clone();
        event.age = Some(now.saturating_sub(self.origin_ts).max(0) as u64);
        event.created_at = None;
        event
    }
}

struct RoomRecord {
    room: Room,
    membership: Membership,
    /// Oldest first
    timeline: Vec<StoredEvent>,
    /// Exclusive upper bound of the next backward page; `None` is the live end
    back_from: Option<usize>,
}

impl RoomRecord {
    fn snapshot(&self, now: i64) -> Room {
        let mut room = self.room.clone();
        room.last_message = self
            .timeline
            .iter()
            .rev()
            .find(|stored| stored.event.event_type == ROOM_MESSAGE)
            .map(|stored| stored.observed(now));
        room
    }
}

#[derive(Default)]
struct ServerState {
    accounts: HashMap<String, Account>,
    tokens: HashMap<String, String>,
    session: Option<Session>,
    rooms: BTreeMap<String, RoomRecord>,
    listening: HashSet<String>,
    public_rooms: Vec<PublicRoom>,
    read_receipts: HashMap<String, String>,
    failing_joins: HashMap<String, String>,
    fail_next_fetch: Option<String>,
    fail_next_search: Option<String>,
    next_event: u64,
}

impl ServerState {
    fn require_session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(MurmurError::NotConnected)
    }

    fn room(&self, room_id: &str) -> Result<&RoomRecord> {
        self.rooms
            .get(room_id)
            .ok_or_else(|| MurmurError::RoomNotFound(room_id.to_string()))
    }

    fn room_mut(&mut self, room_id: &str) -> Result<&mut RoomRecord> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| MurmurError::RoomNotFound(room_id.to_string()))
    }

    fn next_event_id(&mut self) -> String {
        self.next_event += 1;
        format!("$e{}:{}", self.next_event, SERVER_NAME)
    }

    fn rooms_with(&self, membership: Membership) -> Vec<Room> {
        let now = now_millis();
        self.rooms
            .values()
            .filter(|record| record.membership == membership)
            .map(|record| record.snapshot(now))
            .collect()
    }
}

pub struct MemoryClient {
    state: Mutex<ServerState>,
    events: broadcast::Sender<RoomNotification>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    paginate_calls: AtomicUsize,
    search_calls: AtomicUsize,
    /// Emit a whole page without yielding between events
    bursts: AtomicBool,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    /// Hits per search page
    pub const SEARCH_PAGE_SIZE: usize = 10;

    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Notification channel sized from `[events] buffer`
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::with_buffer(config.events.buffer)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            state: Mutex::new(ServerState::default()),
            events,
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            paginate_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            bursts: AtomicBool::new(false),
        }
    }

    fn emit(&self, direction: Direction, event: Event) {
        trace!(room_id = %event.room_id, event_id = %event.event_id, %direction, "emitting event");
        // No receivers just means nobody is listening
        let _ = self.events.send(RoomNotification::new(direction, event));
    }

    // ==================== Fixtures ====================

    /// Create an account; returns its user id
    pub fn register_user(&self, username: &str, password: &str) -> String {
        let user_id = format!("@{}:{}", username, SERVER_NAME);
        self.state.lock().accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                user_id: user_id.clone(),
            },
        );
        user_id
    }

    fn add_room(&self, room_id: &str, name: &str, membership: Membership) {
        self.state.lock().rooms.insert(
            room_id.to_string(),
            RoomRecord {
                room: Room::new(room_id).with_name(name),
                membership,
                timeline: Vec::new(),
                back_from: None,
            },
        );
    }

    pub fn add_joined_room(&self, room_id: &str, name: &str) {
        self.add_room(room_id, name, Membership::Joined);
    }

    /// Add a room the user is invited to
    pub fn invite(&self, room_id: &str, name: &str) {
        self.add_room(room_id, name, Membership::Invited);
    }

    pub fn add_public_room(&self, room: PublicRoom) {
        self.state.lock().public_rooms.push(room);
    }

    /// Emit pagination pages in one go, like a server pushing a whole
    /// chunk at once. Listeners slower than the channel buffer lag.
    pub fn deliver_in_bursts(&self, bursts: bool) {
        self.bursts.store(bursts, Ordering::SeqCst);
    }

    /// Append a historical event with a server timestamp. Not emitted.
    pub fn seed_event(&self, room_id: &str, event: Event, origin_ts: i64) {
        let mut state = self.state.lock();
        if let Some(record) = state.rooms.get_mut(room_id) {
            record.timeline.push(StoredEvent { event, origin_ts });
        }
    }

    /// Append a historical text message; returns its event id
    pub fn seed_text(&self, room_id: &str, sender_id: &str, body: &str, origin_ts: i64) -> String {
        let event_id = self.state.lock().next_event_id();
        let event = Event::message(&event_id, room_id, sender_id, MSGTYPE_TEXT, body);
        self.seed_event(room_id, event, origin_ts);
        event_id
    }

    /// Simulate an event arriving from the server. Emitted forwards when
    /// the room is listened to; returns whether it was.
    pub fn deliver_live(&self, room_id: &str, event: Event) -> bool {
        let now = now_millis();
        let age = i64::try_from(event.age.unwrap_or(0)).unwrap_or(i64::MAX);
        let origin_ts = now.saturating_sub(age);
        let emitted = {
            let mut state = self.state.lock();
            let Some(record) = state.rooms.get_mut(room_id) else {
                return false;
            };
            let stored = StoredEvent { event, origin_ts };
            let observed = stored.observed(now);
            record.timeline.push(stored);
            state.listening.contains(room_id).then_some(observed)
        };

        match emitted {
            Some(event) => {
                self.emit(Direction::Forwards, event);
                true
            }
            None => false,
        }
    }

    /// Emit a backward notification directly, bypassing pagination
    pub fn emit_backwards(&self, room_id: &str, mut event: Event) {
        event.room_id = room_id.to_string();
        self.emit(Direction::Backwards, event);
    }

    /// Make every join of `room_id` fail with a transport error
    pub fn fail_join(&self, room_id: &str, message: &str) {
        self.state
            .lock()
            .failing_joins
            .insert(room_id.to_string(), message.to_string());
    }

    /// Fail the next backward pagination or message fetch
    pub fn fail_next_fetch(&self, message: &str) {
        self.state.lock().fail_next_fetch = Some(message.to_string());
    }

    pub fn fail_next_search(&self, message: &str) {
        self.state.lock().fail_next_search = Some(message.to_string());
    }

    // ==================== Inspection ====================

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn paginate_calls(&self) -> usize {
        self.paginate_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self, room_id: &str) -> bool {
        self.state.lock().listening.contains(room_id)
    }

    /// Last event acknowledged in a room
    pub fn read_receipt(&self, room_id: &str) -> Option<String> {
        self.state.lock().read_receipts.get(room_id).cloned()
    }
}

fn parse_token(token: &str, prefix: char) -> Result<Option<usize>> {
    if token.is_empty() {
        return Ok(None);
    }
    token
        .strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .map(Some)
        .ok_or_else(|| MurmurError::transport(format!("M_INVALID_PARAM: bad token '{}'", token)))
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl ProtocolClient for MemoryClient {
    async fn login(&self, server_url: &str, username: &str, password: &str) -> Result<Session> {
        let mut state = self.state.lock();
        let user_id = match state.accounts.get(username) {
            Some(account) if account.password == password => account.user_id.clone(),
            _ => {
                return Err(MurmurError::transport(
                    "M_FORBIDDEN: invalid username or password",
                ))
            }
        };

        let access_token = Uuid::new_v4().simple().to_string();
        state.tokens.insert(access_token.clone(), user_id.clone());
        debug!(%user_id, "issued access token");
        Ok(Session::new(server_url, user_id, access_token))
    }

    async fn connect(&self, session: &Session) -> Result<UserProfile> {
        let mut state = self.state.lock();
        match state.tokens.get(&session.access_token) {
            Some(user_id) if *user_id == session.user_id => {}
            _ => return Err(MurmurError::transport("M_UNKNOWN_TOKEN: unrecognised access token")),
        }

        // Upstream listeners do not outlive the session they were started in
        state.listening.clear();
        state.session = Some(session.clone());
        let display_name = session
            .user_id
            .trim_start_matches('@')
            .split(':')
            .next()
            .map(str::to_string);
        Ok(UserProfile {
            id: session.user_id.clone(),
            display_name,
            avatar_url: None,
            last_active: Some(0),
            status: Some("online".into()),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.session = None;
        state.listening.clear();
        Ok(())
    }

    async fn create_room(&self, user_id: &str) -> Result<Room> {
        let mut state = self.state.lock();
        state.require_session()?;

        let room_id = format!("!{}:{}", Uuid::new_v4().simple(), SERVER_NAME);
        let mut room = Room::new(&room_id).with_name(user_id);
        room.is_direct = true;
        state.rooms.insert(
            room_id,
            RoomRecord {
                room: room.clone(),
                membership: Membership::Joined,
                timeline: Vec::new(),
                back_from: None,
            },
        );
        Ok(room)
    }

    async fn join_room(&self, room_id: &str) -> Result<Room> {
        let mut state = self.state.lock();
        state.require_session()?;
        if let Some(message) = state.failing_joins.get(room_id) {
            return Err(MurmurError::transport(message.clone()));
        }

        let record = state.room_mut(room_id)?;
        record.membership = Membership::Joined;
        Ok(record.snapshot(now_millis()))
    }

    async fn invited_rooms(&self) -> Result<Vec<Room>> {
        let state = self.state.lock();
        state.require_session()?;
        Ok(state.rooms_with(Membership::Invited))
    }

    async fn joined_rooms(&self) -> Result<Vec<Room>> {
        let state = self.state.lock();
        state.require_session()?;
        Ok(state.rooms_with(Membership::Joined))
    }

    async fn public_rooms(&self, _server_url: &str) -> Result<Vec<PublicRoom>> {
        Ok(self.state.lock().public_rooms.clone())
    }

    async fn start_listening(&self, room_id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.require_session()?;
        state.room(room_id)?;
        if !state.listening.insert(room_id.to_string()) {
            return Err(MurmurError::ListenerConflict(room_id.to_string()));
        }
        Ok(())
    }

    async fn stop_listening(&self, room_id: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().listening.remove(room_id);
        Ok(())
    }

    async fn reset_pagination(&self, room_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.require_session()?;
        state.room_mut(room_id)?.back_from = None;
        Ok(())
    }

    async fn paginate_backwards(&self, room_id: &str, limit: usize) -> Result<()> {
        self.paginate_calls.fetch_add(1, Ordering::SeqCst);
        let page = {
            let mut state = self.state.lock();
            state.require_session()?;
            if let Some(message) = state.fail_next_fetch.take() {
                return Err(MurmurError::transport(message));
            }
            if !state.listening.contains(room_id) {
                return Ok(());
            }

            let record = state.room_mut(room_id)?;
            let upper = record.back_from.unwrap_or(record.timeline.len());
            let lower = upper.saturating_sub(limit);
            record.back_from = Some(lower);

            let now = now_millis();
            record.timeline[lower..upper]
                .iter()
                .rev()
                .map(|stored| stored.observed(now))
                .collect::<Vec<_>>()
        };

        let bursts = self.bursts.load(Ordering::SeqCst);
        for event in page {
            self.emit(Direction::Backwards, event);
            if !bursts {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<MessagePage> {
        let mut state = self.state.lock();
        state.require_session()?;
        if let Some(message) = state.fail_next_fetch.take() {
            return Err(MurmurError::transport(message));
        }

        let record = state.room(room_id)?;
        let len = record.timeline.len();
        let from = parse_token(from, 't')?;
        let now = now_millis();

        let (lower, upper, events) = match direction {
            Direction::Backwards => {
                let upper = from.unwrap_or(len).min(len);
                let lower = upper.saturating_sub(limit);
                let events = record.timeline[lower..upper]
                    .iter()
                    .rev()
                    .map(|stored| stored.observed(now))
                    .collect();
                (lower, upper, events)
            }
            Direction::Forwards => {
                let lower = from.unwrap_or(0).min(len);
                let upper = (lower + limit).min(len);
                let events = record.timeline[lower..upper]
                    .iter()
                    .map(|stored| stored.observed(now))
                    .collect();
                (lower, upper, events)
            }
        };

        let (start, end) = match direction {
            Direction::Backwards => (upper, lower),
            Direction::Forwards => (lower, upper),
        };
        Ok(MessagePage {
            events,
            start: Some(format!("t{}", start)),
            end: Some(format!("t{}", end)),
        })
    }

    async fn search(
        &self,
        room_id: &str,
        term: &str,
        next_batch: &str,
        before_limit: usize,
        after_limit: usize,
    ) -> Result<Option<SearchResponse>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.require_session()?;
        if let Some(message) = state.fail_next_search.take() {
            return Err(MurmurError::transport(message));
        }

        let record = state.room(room_id)?;
        let offset = parse_token(next_batch, 'b')?.unwrap_or(0);
        let now = now_millis();

        // Newest first
        let matches: Vec<usize> = (0..record.timeline.len())
            .rev()
            .filter(|&i| {
                let event = &record.timeline[i].event;
                event.event_type == ROOM_MESSAGE
                    && event.body().is_some_and(|body| contains_ignore_case(body, term))
            })
            .collect();

        let page: Vec<usize> = matches
            .iter()
            .copied()
            .skip(offset)
            .take(Self::SEARCH_PAGE_SIZE)
            .collect();

        let results = page
            .iter()
            .map(|&i| {
                let first = i.saturating_sub(before_limit);
                let last = (i + 1 + after_limit).min(record.timeline.len());
                SearchHit {
                    event: record.timeline[i].observed(now),
                    context: HitContext {
                        before: record.timeline[first..i]
                            .iter()
                            .rev()
                            .map(|stored| stored.observed(now))
                            .collect(),
                        after: record.timeline[i + 1..last]
                            .iter()
                            .map(|stored| stored.observed(now))
                            .collect(),
                    },
                    token: ContextToken {
                        start: Some(format!("t{}", first)),
                        end: Some(format!("t{}", last)),
                    },
                }
            })
            .collect();

        let consumed = offset + page.len();
        let next_batch = (consumed < matches.len()).then(|| format!("b{}", consumed));
        Ok(Some(SearchResponse {
            results,
            next_batch,
            count: matches.len() as u64,
        }))
    }

    async fn send_message(&self, room_id: &str, content: Content) -> Result<String> {
        let now = now_millis();
        let (event_id, observed, listening) = {
            let mut state = self.state.lock();
            let sender_id = state.require_session()?.user_id.clone();
            state.room(room_id)?;
            let event_id = state.next_event_id();
            let listening = state.listening.contains(room_id);

            let stored = StoredEvent {
                event: Event::new(ROOM_MESSAGE, &event_id, room_id, sender_id).with_content(content),
                origin_ts: now,
            };
            let observed = stored.observed(now);
            state.room_mut(room_id)?.timeline.push(stored);
            (event_id, observed, listening)
        };

        if listening {
            self.emit(Direction::Forwards, observed);
        }
        Ok(event_id)
    }

    async fn send_read_receipt(&self, room_id: &str, event_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.require_session()?;
        let record = state.room_mut(room_id)?;
        record.room.notification_count = 0;
        record.room.highlight_count = 0;
        state
            .read_receipts
            .insert(room_id.to_string(), event_id.to_string());
        Ok(())
    }

    async fn unread_event_types(&self) -> Result<Vec<String>> {
        self.state.lock().require_session()?;
        Ok(vec![ROOM_MESSAGE.to_string()])
    }

    async fn recent_events(&self, event_types: &[String]) -> Result<Vec<Vec<Event>>> {
        let state = self.state.lock();
        state.require_session()?;
        let now = now_millis();

        Ok(state
            .rooms
            .values()
            .filter(|record| record.membership == Membership::Joined)
            .filter_map(|record| {
                record
                    .timeline
                    .iter()
                    .rev()
                    .find(|stored| event_types.contains(&stored.event.event_type))
                    .map(|stored| vec![stored.observed(now)])
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomNotification> {
        self.events.subscribe()
    }
}
