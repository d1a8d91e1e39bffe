//! Event bus: the backbone every store mutation and adapter notification
//! flows through.
//!
//! Grounded on the teacher's `bus::EventBus` (`tokio::sync::broadcast`); the
//! teacher kept a second, narrower `BusEvent` enum in this file that
//! duplicated the richer one in `bus::events` — that duplication had no
//! purpose here, so this module now only wraps the broadcast channel and
//! re-exports the single canonical event type from [`events`].

pub mod events;
pub mod fanout;

pub use events::BusEvent;

use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: BusEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = create_bus();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(BusEvent::SystemShuttingDown { reason: None });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            BusEvent::SystemShuttingDown { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            BusEvent::SystemShuttingDown { .. }
        ));
    }
}
