//! Live fan-out of persisted events.
//!
//! The [`EventBus`] is a thin wrapper over a `tokio::sync::broadcast`
//! channel. The event store publishes every record after it is durable;
//! projections subscribe to it for their live tail. Each subscriber owns a
//! bounded queue, so a slow subscriber lags (and recovers by re-reading the
//! log) instead of holding up writers.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::AggregateEvent;

/// Default number of events a subscriber may fall behind before it lags.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Receiving half handed out by [`EventBus::subscribe`].
pub type EventReceiver = broadcast::Receiver<Arc<AggregateEvent>>;

/// Broadcast channel for persisted events.
///
/// Cloning the bus shares the channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<AggregateEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose subscribers each buffer up to `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, as `tokio::sync::broadcast` does.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events published from now on. There is no replay of
    /// earlier events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish one event to every current subscriber.
    ///
    /// Never blocks. Having no subscribers is not an error.
    pub fn publish(&self, event: Arc<AggregateEvent>) {
        let id = event.id;
        match self.sender.send(event) {
            Ok(receivers) => tracing::trace!(event_id = id, receivers, "event published"),
            Err(_) => tracing::trace!(event_id = id, "event published with no subscribers"),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
