//! Event handler trait and utilities

use murmur_protocol::Event;

/// Trait for handling events delivered to a room listener
pub trait EventHandler: Send {
    /// Handle one event (already stamped with `created_at`)
    fn handle(&mut self, event: Event);

    /// Called once when the listener is removed
    fn on_removed(&mut self) {}
}

/// Simple callback-based handler
pub struct CallbackHandler<F>
where
    F: FnMut(Event) + Send,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: FnMut(Event) + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventHandler for CallbackHandler<F>
where
    F: FnMut(Event) + Send,
{
    fn handle(&mut self, event: Event) {
        (self.callback)(event);
    }
}
