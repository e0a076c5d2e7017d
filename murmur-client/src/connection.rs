//! Seam between the engine and the chat protocol client
//!
//! Commands are async trait calls; raw events arrive on one shared
//! broadcast channel per process and are fanned out by the listener
//! multiplexer.

mod client;
mod handler;

pub use client::{ProtocolClient, SharedClient};
pub use handler::{CallbackHandler, EventHandler};
