//! Backward history loading
//!
//! History pages are delivered by the protocol client through the room's
//! upstream listener, not in the request's response. The loader attaches
//! a temporary collector before issuing the request and reads it while
//! the request is in flight, then drains what is left once it completes.
//! Every event of the page is captured and nothing delivered after the
//! response is. If the collector falls behind the shared channel the
//! page is incomplete and the load fails instead of returning it.

use tracing::{debug, warn};

use murmur_protocol::{now_millis, Direction, Event, MessagePage};
use murmur_utils::{MurmurError, Result};

use crate::connection::SharedClient;
use crate::listeners::{Lagged, RoomListenerMux, RoomSubscription};
use crate::session::ConnectionGate;

/// Default number of events per backward page
pub const DEFAULT_PAGE_SIZE: usize = 15;

/// Outcome of a backward load
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryPage {
    /// Events of the page, newest first
    Loaded(Vec<Event>),
    /// The room has no backward listener, so nothing was requested
    NoActiveListener,
}

impl HistoryPage {
    pub fn events(&self) -> &[Event] {
        match self {
            HistoryPage::Loaded(events) => events,
            HistoryPage::NoActiveListener => &[],
        }
    }

    pub fn into_events(self) -> Vec<Event> {
        match self {
            HistoryPage::Loaded(events) => events,
            HistoryPage::NoActiveListener => Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, HistoryPage::Loaded(_))
    }

    /// Events of a loaded page, or [`MurmurError::NoActiveListener`] for
    /// callers that treat a missing listener as an error
    pub fn require_loaded(self, room_id: &str) -> Result<Vec<Event>> {
        match self {
            HistoryPage::Loaded(events) => Ok(events),
            HistoryPage::NoActiveListener => {
                Err(MurmurError::NoActiveListener(room_id.to_string()))
            }
        }
    }
}

#[derive(Clone)]
pub struct HistoryLoader {
    client: SharedClient,
    listeners: RoomListenerMux,
    gate: ConnectionGate,
}

impl HistoryLoader {
    pub fn new(client: SharedClient, listeners: RoomListenerMux, gate: ConnectionGate) -> Self {
        Self {
            client,
            listeners,
            gate,
        }
    }

    /// Load the next page of older events for `room_id`.
    ///
    /// Requires a backward listener on the room; without one the result
    /// is [`HistoryPage::NoActiveListener`] and no request is made. With
    /// `initial_load` the pagination cursor is reset to the live end first.
    pub async fn load_backwards(
        &self,
        room_id: &str,
        per_page: usize,
        initial_load: bool,
    ) -> Result<HistoryPage> {
        let Some(mut collector) = self.listeners.join_active(room_id, Direction::Backwards).await?
        else {
            debug!(room_id, "no backward listener, skipping history load");
            return Ok(HistoryPage::NoActiveListener);
        };

        let mut events = Vec::new();
        let collected = self
            .collect(&mut collector, &mut events, room_id, per_page, initial_load)
            .await;
        if let Err(e) = collected {
            warn!(room_id, error = %e, "backward pagination failed");
            if let Err(remove_err) = collector.remove().await {
                warn!(room_id, error = %remove_err, "failed to release history collector");
            }
            return Err(e);
        }

        collector.remove().await?;
        debug!(room_id, count = events.len(), initial_load, "history page loaded");
        Ok(HistoryPage::Loaded(events))
    }

    /// Run the fetch while reading the collector, then drain the rest
    async fn collect(
        &self,
        collector: &mut RoomSubscription,
        events: &mut Vec<Event>,
        room_id: &str,
        per_page: usize,
        initial_load: bool,
    ) -> Result<()> {
        let fetch = self.paginate(room_id, per_page, initial_load);
        tokio::pin!(fetch);

        loop {
            tokio::select! {
                biased;
                fetched = &mut fetch => {
                    fetched.map_err(MurmurError::into_fetch_failed)?;
                    break;
                }
                received = collector.recv_exact() => match received {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {
                        (&mut fetch).await.map_err(MurmurError::into_fetch_failed)?;
                        break;
                    }
                    Err(lagged) => return Err(lag_error(lagged)),
                },
            }
        }

        loop {
            match collector.try_recv_exact() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(lagged) => return Err(lag_error(lagged)),
            }
        }

        if collector.is_stale() {
            return Err(MurmurError::FetchFailed(
                "session reset while loading history".into(),
            ));
        }
        Ok(())
    }

    async fn paginate(&self, room_id: &str, per_page: usize, initial_load: bool) -> Result<()> {
        if initial_load {
            self.client.reset_pagination(room_id).await?;
        }
        self.client.paginate_backwards(room_id, per_page).await
    }

    /// Fetch one chunk of messages from an explicit cursor.
    ///
    /// An empty `from` starts at the end matching `direction`.
    pub async fn fetch_page(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<MessagePage> {
        self.gate.ensure_connected()?;

        let mut page = self
            .client
            .get_messages(room_id, from, direction, limit)
            .await
            .map_err(MurmurError::into_fetch_failed)?;

        let now = now_millis();
        for event in &mut page.events {
            event.stamp_created_at(now);
        }
        Ok(page)
    }
}

fn lag_error(Lagged(skipped): Lagged) -> MurmurError {
    MurmurError::FetchFailed(format!(
        "history collector fell behind, {} events dropped",
        skipped
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClient;
    use crate::session::SessionManager;
    use crate::testing::{connected_manager, connected_with, text_event};
    use std::sync::Arc;

    const ROOM: &str = "!room:murmur.local";

    async fn seeded(count: usize) -> (Arc<MemoryClient>, SessionManager) {
        seed(connected_manager().await, count)
    }

    async fn seeded_with_buffer(buffer: usize, count: usize) -> (Arc<MemoryClient>, SessionManager) {
        seed(connected_with(MemoryClient::with_buffer(buffer)).await, count)
    }

    fn seed(
        (client, manager): (Arc<MemoryClient>, SessionManager),
        count: usize,
    ) -> (Arc<MemoryClient>, SessionManager) {
        client.add_joined_room(ROOM, "Room");
        let base = now_millis() - 1_000_000;
        for i in 0..count {
            client.seed_text(ROOM, "@bob:murmur.local", &format!("m{}", i), base + i as i64 * 1_000);
        }
        (client, manager)
    }

    fn bodies(page: &HistoryPage) -> Vec<String> {
        page.events()
            .iter()
            .filter_map(|e| e.body().map(str::to_string))
            .collect()
    }

    // ==================== Precondition Tests ====================

    #[tokio::test]
    async fn test_no_backward_listener() {
        let (client, manager) = seeded(5).await;

        let page = manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        assert_eq!(page, HistoryPage::NoActiveListener);
        assert_eq!(client.start_calls(), 0);
        assert_eq!(client.paginate_calls(), 0);

        match page.require_loaded(ROOM) {
            Err(MurmurError::NoActiveListener(room_id)) => assert_eq!(room_id, ROOM),
            other => panic!("expected NoActiveListener, got {:?}", other),
        }
    }

    #[test]
    fn test_require_loaded_returns_events() {
        let page = HistoryPage::Loaded(vec![text_event("$a", ROOM, 0)]);
        let events = page.require_loaded(ROOM).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_listener_is_not_enough() {
        let (client, manager) = seeded(5).await;
        let _live = manager
            .listeners()
            .add_listener(ROOM, Direction::Forwards)
            .await
            .unwrap();

        let page = manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        assert!(!page.is_loaded());
        assert_eq!(client.paginate_calls(), 0);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let (_client, manager) = seeded(1).await;
        manager.disconnect().await.unwrap();

        let result = manager.history().load_backwards(ROOM, 15, true).await;
        assert!(matches!(result, Err(MurmurError::NotConnected)));
    }

    // ==================== Paging Tests ====================

    #[tokio::test]
    async fn test_pages_newest_first_and_continues() {
        let (_client, manager) = seeded(5).await;
        let _backwards = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();

        let first = manager.history().load_backwards(ROOM, 2, true).await.unwrap();
        assert_eq!(bodies(&first), vec!["m4", "m3"]);
        assert!(first.events().iter().all(|e| e.created_at.is_some()));

        let second = manager.history().load_backwards(ROOM, 2, false).await.unwrap();
        assert_eq!(bodies(&second), vec!["m2", "m1"]);

        let third = manager.history().load_backwards(ROOM, 2, false).await.unwrap();
        assert_eq!(bodies(&third), vec!["m0"]);

        let exhausted = manager.history().load_backwards(ROOM, 2, false).await.unwrap();
        assert_eq!(exhausted, HistoryPage::Loaded(Vec::new()));

        let restarted = manager.history().load_backwards(ROOM, 2, true).await.unwrap();
        assert_eq!(bodies(&restarted), vec!["m4", "m3"]);
    }

    #[tokio::test]
    async fn test_collector_released_after_load() {
        let (client, manager) = seeded(3).await;
        let backwards = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();

        manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        assert_eq!(manager.listeners().listener_count(ROOM).await, 1);
        assert_eq!(client.start_calls(), 1);
        assert_eq!(client.stop_calls(), 0);

        backwards.remove().await.unwrap();
        assert_eq!(client.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_user_listener_also_sees_page() {
        let (_client, manager) = seeded(2).await;
        let mut backwards = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();

        manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        assert_eq!(backwards.try_recv().and_then(|e| e.body().map(str::to_string)).as_deref(), Some("m1"));
        assert_eq!(backwards.try_recv().and_then(|e| e.body().map(str::to_string)).as_deref(), Some("m0"));
    }

    #[tokio::test]
    async fn test_events_after_response_not_collected() {
        let (client, manager) = seeded(2).await;
        let _backwards = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();

        let page = manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        client.emit_backwards(ROOM, text_event("$late", ROOM, 10));

        assert_eq!(page.events().len(), 2);
        assert!(page.events().iter().all(|e| e.event_id != "$late"));
    }

    #[tokio::test]
    async fn test_other_rooms_not_collected() {
        let (client, manager) = seeded(2).await;
        client.add_joined_room("!other:murmur.local", "Other");
        client.seed_text("!other:murmur.local", "@bob:murmur.local", "elsewhere", now_millis());
        let _mine = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();
        let _theirs = manager
            .listeners()
            .add_listener("!other:murmur.local", Direction::Backwards)
            .await
            .unwrap();

        manager
            .history()
            .load_backwards("!other:murmur.local", 15, true)
            .await
            .unwrap();
        let page = manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        assert_eq!(bodies(&page), vec!["m1", "m0"]);
    }

    #[tokio::test]
    async fn test_page_larger_than_channel_buffer() {
        let (_client, manager) = seeded_with_buffer(8, 20).await;
        let _backwards = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();

        let page = manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        let expected: Vec<String> = (5..20).rev().map(|i| format!("m{}", i)).collect();
        assert_eq!(bodies(&page), expected);

        let next = manager.history().load_backwards(ROOM, 15, false).await.unwrap();
        assert_eq!(bodies(&next), vec!["m4", "m3", "m2", "m1", "m0"]);
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn test_lagging_collector_fails_load() {
        let (client, manager) = seeded_with_buffer(8, 20).await;
        client.deliver_in_bursts(true);
        let _backwards = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();

        let result = manager.history().load_backwards(ROOM, 15, true).await;
        match result {
            Err(MurmurError::FetchFailed(message)) => assert!(message.contains("7 events dropped")),
            other => panic!("expected FetchFailed, got {:?}", other),
        }
        assert_eq!(manager.listeners().listener_count(ROOM).await, 1);

        client.deliver_in_bursts(false);
        let retry = manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        assert_eq!(retry.events().len(), 15);
    }

    #[tokio::test]
    async fn test_fetch_failure_releases_collector() {
        let (client, manager) = seeded(2).await;
        let _backwards = manager
            .listeners()
            .add_listener(ROOM, Direction::Backwards)
            .await
            .unwrap();
        client.fail_next_fetch("upstream timeout");

        let result = manager.history().load_backwards(ROOM, 15, true).await;
        match result {
            Err(MurmurError::FetchFailed(message)) => assert_eq!(message, "upstream timeout"),
            other => panic!("expected FetchFailed, got {:?}", other),
        }
        assert_eq!(manager.listeners().listener_count(ROOM).await, 1);

        let retry = manager.history().load_backwards(ROOM, 15, true).await.unwrap();
        assert_eq!(bodies(&retry), vec!["m1", "m0"]);
    }

    // ==================== Explicit Cursor Tests ====================

    #[tokio::test]
    async fn test_fetch_page_backwards_and_forwards() {
        let (_client, manager) = seeded(5).await;

        let page = manager
            .history()
            .fetch_page(ROOM, "", Direction::Backwards, 2)
            .await
            .unwrap();
        let ids: Vec<_> = page.events.iter().filter_map(|e| e.body()).collect();
        assert_eq!(ids, vec!["m4", "m3"]);
        assert!(page.events.iter().all(|e| e.created_at.is_some()));

        let end = page.end.clone().unwrap();
        let older = manager
            .history()
            .fetch_page(ROOM, &end, Direction::Backwards, 2)
            .await
            .unwrap();
        let ids: Vec<_> = older.events.iter().filter_map(|e| e.body()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);

        let forwards = manager
            .history()
            .fetch_page(ROOM, "", Direction::Forwards, 2)
            .await
            .unwrap();
        let ids: Vec<_> = forwards.events.iter().filter_map(|e| e.body()).collect();
        assert_eq!(ids, vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn test_fetch_page_bad_cursor() {
        let (_client, manager) = seeded(1).await;

        let result = manager
            .history()
            .fetch_page(ROOM, "garbage", Direction::Backwards, 2)
            .await;
        assert!(matches!(result, Err(MurmurError::FetchFailed(_))));
    }

    #[tokio::test]
    async fn test_fetch_page_unknown_room() {
        let (_client, manager) = seeded(0).await;

        let result = manager
            .history()
            .fetch_page("!missing:murmur.local", "", Direction::Backwards, 2)
            .await;
        assert!(matches!(result, Err(MurmurError::RoomNotFound(_))));
    }
}
