//! murmur-client: Room event synchronization and grouping engine
//!
//! Sits between a chat protocol client and a UI:
//! - [`session`]: login, connect, auto-join and room operations
//! - [`listeners`]: reference-counted room listeners over one upstream listener per room
//! - [`history`]: backward history pages captured from the listener channel
//! - [`search`]: paged full-text search with per-hit context
//! - [`sections`]: grouping events into display sections
//! - [`memory`]: in-memory [`ProtocolClient`] for tests and demos

pub mod config;
pub mod connection;
pub mod history;
pub mod listeners;
pub mod memory;
pub mod search;
pub mod sections;
pub mod session;
pub mod timeline;

#[cfg(test)]
mod testing;

pub use config::{load_config, load_config_from, ClientConfig};
pub use connection::{CallbackHandler, EventHandler, ProtocolClient, SharedClient};
pub use history::{HistoryLoader, HistoryPage, DEFAULT_PAGE_SIZE};
pub use listeners::{Lagged, ListenerHandle, RoomListenerMux, RoomSubscription};
pub use memory::MemoryClient;
pub use search::{SearchContext, DEFAULT_SEARCH_LIMIT};
pub use sections::{EventStream, SectionGrouper, DEFAULT_DEBOUNCE_MS};
pub use session::{
    text_content, AutoJoinReport, Connected, ConnectionGate, ConnectionState, JoinFailure,
    SessionManager,
};
pub use timeline::RoomTimeline;
