//! Shared fixtures for unit tests

use std::sync::Arc;

use murmur_protocol::{Event, MSGTYPE_TEXT};

use crate::config::ClientConfig;
use crate::memory::MemoryClient;
use crate::session::SessionManager;

pub const HOMESERVER: &str = "https://murmur.local";

/// A manager logged in and connected as `@alice:murmur.local`
pub async fn connected_manager() -> (Arc<MemoryClient>, SessionManager) {
    connected_with(MemoryClient::from_config(&ClientConfig::default())).await
}

/// Like [`connected_manager`], over a caller-built client
pub async fn connected_with(client: MemoryClient) -> (Arc<MemoryClient>, SessionManager) {
    let client = Arc::new(client);
    client.register_user("alice", "hunter2");
    let manager = SessionManager::new(client.clone());

    let session = manager
        .login(HOMESERVER, "alice", "hunter2")
        .await
        .expect("login");
    manager.connect(session).await.expect("connect");
    (client, manager)
}

/// Text message from bob observed `age` ms after it was sent
pub fn text_event(event_id: &str, room_id: &str, age: u64) -> Event {
    Event::message(event_id, room_id, "@bob:murmur.local", MSGTYPE_TEXT, event_id).with_age(age)
}
