//! Room listener multiplexing
//!
//! The protocol client accepts a single upstream listener per room. The
//! multiplexer keeps a reference-counted registry of local listeners per
//! room: the first local listener starts the upstream one, the last
//! removal stops it. Every local listener reads the shared notification
//! channel and keeps only events for its own room and direction.
//!
//! A session reset clears the registry: listeners registered before it
//! end, and the next attach to any room starts its upstream listener again.

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_protocol::{now_millis, Direction, Event, RoomNotification};
use murmur_utils::{MurmurError, Result};

use crate::connection::{EventHandler, SharedClient};
use crate::session::ConnectionGate;

#[derive(Debug, Clone, Copy)]
struct ListenerSlot {
    id: Uuid,
    direction: Direction,
}

struct MuxInner {
    client: SharedClient,
    gate: ConnectionGate,
    /// Held across upstream start/stop so registry and upstream agree
    rooms: Mutex<HashMap<String, Vec<ListenerSlot>>>,
    /// Bumped on every reset; subscriptions from older epochs are stale
    epoch: watch::Sender<u64>,
}

impl MuxInner {
    /// Register a local listener; the caller holds the registry lock
    async fn attach(
        self: &Arc<Self>,
        rooms: &mut HashMap<String, Vec<ListenerSlot>>,
        room_id: &str,
        direction: Direction,
    ) -> Result<RoomSubscription> {
        // Subscribe first so nothing emitted by the upstream start is missed
        let receiver = self.client.subscribe();
        let epoch_rx = self.epoch.subscribe();
        let epoch = *epoch_rx.borrow();

        let first = rooms.get(room_id).map_or(true, Vec::is_empty);
        if first {
            self.client.start_listening(room_id).await?;
            info!(room_id, "upstream listener started");
        }

        let id = Uuid::new_v4();
        let slots = rooms.entry(room_id.to_string()).or_default();
        slots.push(ListenerSlot { id, direction });
        debug!(room_id, %id, %direction, count = slots.len(), "listener added");

        Ok(RoomSubscription {
            id,
            room_id: room_id.to_string(),
            direction,
            receiver,
            epoch,
            epoch_rx,
            mux: Arc::clone(self),
            released: false,
        })
    }

    /// Forget every registered listener without touching upstream
    async fn reset(&self) {
        let mut rooms = self.rooms.lock().await;
        let dropped: usize = rooms.values().map(Vec::len).sum();
        rooms.clear();
        self.epoch.send_modify(|epoch| *epoch += 1);
        info!(dropped, "listener registry reset");
    }

    /// Drop one local listener; stops upstream when it was the last one
    async fn release(&self, room_id: &str, id: Uuid) -> Result<()> {
        let mut rooms = self.rooms.lock().await;

        let Some(slots) = rooms.get_mut(room_id) else {
            return Ok(());
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        if slots.len() == before {
            return Ok(());
        }
        debug!(room_id, %id, count = slots.len(), "listener removed");

        if slots.is_empty() {
            rooms.remove(room_id);
            self.client.stop_listening(room_id).await?;
            info!(room_id, "upstream listener stopped");
        }
        Ok(())
    }
}

/// Reference-counted registry of local room listeners
#[derive(Clone)]
pub struct RoomListenerMux {
    inner: Arc<MuxInner>,
}

impl RoomListenerMux {
    pub fn new(client: SharedClient, gate: ConnectionGate) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(MuxInner {
                client,
                gate,
                rooms: Mutex::new(HashMap::new()),
                epoch,
            }),
        }
    }

    /// Register a pull-style listener for one room and direction
    pub async fn add_listener(&self, room_id: &str, direction: Direction) -> Result<RoomSubscription> {
        self.inner.gate.ensure_connected()?;
        let mut rooms = self.inner.rooms.lock().await;
        self.inner.attach(&mut rooms, room_id, direction).await
    }

    /// Attach a listener only if the room already has one for `direction`.
    ///
    /// The check and the attach happen under one lock acquisition, so the
    /// upstream listener cannot be stopped in between.
    pub async fn join_active(
        &self,
        room_id: &str,
        direction: Direction,
    ) -> Result<Option<RoomSubscription>> {
        self.inner.gate.ensure_connected()?;
        let mut rooms = self.inner.rooms.lock().await;

        let active = rooms
            .get(room_id)
            .is_some_and(|slots| slots.iter().any(|slot| slot.direction == direction));
        if !active {
            return Ok(None);
        }

        self.inner.attach(&mut rooms, room_id, direction).await.map(Some)
    }

    /// Register a callback listener driven by a background task
    pub async fn on_event<H>(&self, room_id: &str, direction: Direction, handler: H) -> Result<ListenerHandle>
    where
        H: EventHandler + 'static,
    {
        let subscription = self.add_listener(room_id, direction).await?;
        let id = subscription.id();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(pump(subscription, handler, cancel_rx));

        Ok(ListenerHandle {
            id,
            room_id: room_id.to_string(),
            cancel: Some(cancel_tx),
            task: Some(task),
        })
    }

    pub async fn has_listener(&self, room_id: &str, direction: Direction) -> bool {
        let rooms = self.inner.rooms.lock().await;
        rooms
            .get(room_id)
            .is_some_and(|slots| slots.iter().any(|slot| slot.direction == direction))
    }

    /// Local listeners registered for a room, any direction
    pub async fn listener_count(&self, room_id: &str) -> usize {
        let rooms = self.inner.rooms.lock().await;
        rooms.get(room_id).map_or(0, Vec::len)
    }

    /// End every registered listener and empty the registry.
    ///
    /// Called when the session goes away, since the protocol client drops
    /// its upstream listeners with it. Outstanding subscriptions stop
    /// yielding events and their later release is a no-op.
    pub async fn reset(&self) {
        self.inner.reset().await;
    }

    /// Rooms with a running upstream listener
    pub async fn active_rooms(&self) -> Vec<String> {
        let rooms = self.inner.rooms.lock().await;
        let mut active: Vec<String> = rooms.keys().cloned().collect();
        active.sort();
        active
    }
}

/// Pull-style local listener.
///
/// Yields events of one room and direction, stamped with `created_at`.
/// Dropping the subscription releases it in the background; call
/// [`RoomSubscription::remove`] to release it and observe the result.
pub struct RoomSubscription {
    id: Uuid,
    room_id: String,
    direction: Direction,
    receiver: broadcast::Receiver<RoomNotification>,
    /// Registry epoch at attach time
    epoch: u64,
    epoch_rx: watch::Receiver<u64>,
    mux: Arc<MuxInner>,
    released: bool,
}

/// Events were overwritten in the channel before this listener read them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lagged(pub u64);

impl RoomSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn accept(&self, notification: RoomNotification) -> Option<Event> {
        if !notification.matches(&self.room_id, self.direction) {
            return None;
        }
        Some(notification.event.stamped(now_millis()))
    }

    /// The registry was reset since this listener was attached
    pub fn is_stale(&self) -> bool {
        *self.epoch_rx.borrow() != self.epoch
    }

    /// Wait for the next matching event.
    ///
    /// `None` once the channel closes or the registry is reset. Lag is
    /// logged and skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.recv_exact().await {
                Ok(event) => return event,
                Err(Lagged(skipped)) => {
                    warn!(room_id = %self.room_id, skipped, "listener lagged, events dropped");
                }
            }
        }
    }

    /// Next matching event already buffered, without waiting. Lag is
    /// logged and skipped.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.try_recv_exact() {
                Ok(event) => return event,
                Err(Lagged(skipped)) => {
                    warn!(room_id = %self.room_id, skipped, "listener lagged, events dropped");
                }
            }
        }
    }

    /// Like [`Self::recv`], but reports lag instead of skipping past it
    pub async fn recv_exact(&mut self) -> std::result::Result<Option<Event>, Lagged> {
        loop {
            if self.is_stale() {
                return Ok(None);
            }
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Ok(notification) => {
                        if let Some(event) = self.accept(notification) {
                            return Ok(Some(event));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => return Err(Lagged(skipped)),
                    Err(RecvError::Closed) => return Ok(None),
                },
                changed = self.epoch_rx.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Like [`Self::try_recv`], but reports lag instead of skipping past it
    pub fn try_recv_exact(&mut self) -> std::result::Result<Option<Event>, Lagged> {
        loop {
            if self.is_stale() {
                return Ok(None);
            }
            match self.receiver.try_recv() {
                Ok(notification) => {
                    if let Some(event) = self.accept(notification) {
                        return Ok(Some(event));
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => return Err(Lagged(skipped)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Adapt into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }

    /// Release this listener, stopping upstream if it was the last one
    pub async fn remove(mut self) -> Result<()> {
        self.released = true;
        self.mux.release(&self.room_id, self.id).await
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let mux = Arc::clone(&self.mux);
        let room_id = self.room_id.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = mux.release(&room_id, id).await {
                        warn!(room_id = %room_id, error = %e, "failed to release dropped listener");
                    }
                });
            }
            Err(_) => {
                warn!(room_id = %self.room_id, "listener dropped outside a runtime, upstream left running");
            }
        }
    }
}

impl std::fmt::Debug for RoomSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSubscription")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Handle to a callback listener. Dropping it also removes the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    id: Uuid,
    room_id: String,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ListenerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Stop delivery and wait until the listener is released
    pub async fn remove(mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| MurmurError::internal(format!("listener task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

async fn pump<H: EventHandler>(
    mut subscription: RoomSubscription,
    mut handler: H,
    mut cancel: oneshot::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            event = subscription.recv() => match event {
                Some(event) => handler.handle(event),
                None => break,
            },
        }
    }
    handler.on_removed();
    subscription.remove().await
}
