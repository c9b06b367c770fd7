//! Event system for dispatch tracking
//!
//! An in-process event bus that lets the binaries (or tests) watch queue
//! and scheduled-post transitions without polling storage.
//!
//! Built on `tokio::sync::broadcast`: emitting with no subscribers drops the
//! event, and a lagging subscriber misses the oldest events instead of
//! blocking the services.
//!
//! # Example
//!
//! ```no_run
//! use libgramcast::service::events::{Event, EventBus};
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::ItemCanceled {
//!     queue_id: "abc123".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging subscribers
    /// start losing events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Never blocks and never fails
    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Transitions emitted by the queue processor and the scheduled-post
/// lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ItemEnqueued {
        queue_id: String,
        account_id: String,
        scheduled_at: i64,
    },

    /// Rate limiter pushed the item back; no attempt consumed
    ItemDeferred { queue_id: String, until: i64 },

    ItemRetrying {
        queue_id: String,
        attempt: u32,
        retry_at: i64,
        error: String,
    },

    ItemCompleted {
        queue_id: String,
        external_media_id: String,
    },

    ItemFailed { queue_id: String, error: String },

    ItemCanceled { queue_id: String },

    ScheduledPostDeferred {
        scheduled_post_id: String,
        until: i64,
    },

    ScheduledPostPublished {
        scheduled_post_id: String,
        external_media_id: String,
    },

    ScheduledPostFailed {
        scheduled_post_id: String,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_emission_and_subscription() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.emit(Event::ItemDeferred {
            queue_id: "q-1".to_string(),
            until: 3_600,
        });

        match receiver.recv().await.unwrap() {
            Event::ItemDeferred { queue_id, until } => {
                assert_eq!(queue_id, "q-1");
                assert_eq!(until, 3_600);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        let event = Event::ItemCompleted {
            queue_id: "q-2".to_string(),
            external_media_id: "ig-9".to_string(),
        };
        event_bus.emit(event.clone());

        assert_eq!(receiver1.recv().await.unwrap(), event);
        assert_eq!(receiver2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let event_bus = EventBus::new(10);

        // Should not panic or block
        event_bus.emit(Event::ItemCanceled {
            queue_id: "q-3".to_string(),
        });
        assert_eq!(event_bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::ScheduledPostFailed {
            scheduled_post_id: "s-1".to_string(),
            error: "Network timeout".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"scheduled_post_failed""#));
        assert!(json.contains("Network timeout"));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
