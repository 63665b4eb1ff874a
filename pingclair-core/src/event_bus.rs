//! In-process publish/subscribe event bus.
//!
//! Built on `tokio::sync::broadcast`: per-subscriber ordering is the
//! channel's FIFO guarantee, and a bounded queue means a slow subscriber
//! lags and skips ahead rather than blocking the publisher.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Events flowing through the bus. Variants line up with spec §4.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Emitted by the registry after a successful manifest PUT.
    ImagePushed {
        name: String,
        reference: String,
        manifest: Vec<u8>,
        annotations: HashMap<String, String>,
    },
    /// Operator-initiated reload of routes.
    ConfigReload,
    /// Emitted by the reactor as it listens to the runtime.
    ContainerStart {
        container_id: String,
        container_name: String,
        container_ip: String,
    },
    ContainerStop {
        container_id: String,
        container_name: String,
    },
}

impl Event {
    /// A stable discriminant used for structured logging and metrics, since
    /// `Event` itself carries payloads that aren't always log-worthy in
    /// full.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ImagePushed { .. } => "ImagePushed",
            Event::ConfigReload => "ConfigReload",
            Event::ContainerStart { .. } => "ContainerStart",
            Event::ContainerStop { .. } => "ContainerStop",
        }
    }
}

/// A handle to subscribe to and publish on the bus. Cheaply cloneable; all
/// clones share the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publishes an event to all current subscribers. Returns the number of
    /// subscribers the event was attempted on (mirrors
    /// `broadcast::Sender::send`); a bus with no subscribers is not an
    /// error.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::debug!(kind, receivers, "event published");
            }
            Err(_) => {
                tracing::trace!(kind, "event published with no active subscribers");
            }
        }
    }

    /// Returns a new subscription. Each subscriber gets its own lagging
    /// cursor; a subscriber that falls behind by more than the channel
    /// capacity observes a `Lagged` error and should log and continue.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// A live subscription handle. Dropping it unsubscribes.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    /// Awaits the next event, logging and skipping ahead on lag rather than
    /// surfacing it as a fatal error to the caller.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, skipping ahead");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscriber_in_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(Event::ConfigReload);
        bus.publish(Event::ContainerStop {
            container_id: "c1".into(),
            container_name: "web".into(),
        });

        assert!(matches!(sub.recv().await, Some(Event::ConfigReload)));
        assert!(matches!(sub.recv().await, Some(Event::ContainerStop { .. })));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::ConfigReload);
    }

    #[tokio::test]
    async fn independent_subscribers_each_see_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::ConfigReload);

        assert!(matches!(a.recv().await, Some(Event::ConfigReload)));
        assert!(matches!(b.recv().await, Some(Event::ConfigReload)));
    }
}
