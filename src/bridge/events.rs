//! Event bus for agent server events
//!
//! Single-producer, multi-consumer delivery of everything that happens on the
//! agent process: inbound RPC traffic the supervisor does not consume itself,
//! stderr lines, and the final exit. Delivery order equals production order.
//! Subscribers that attach late miss earlier events - there is no replay
//! buffer; history retention is the consumer's business.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber before lagging starts
/// dropping the oldest
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Everything the agent process surfaces to consumers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    /// An inbound JSON-RPC message not consumed by a pending call:
    /// server-initiated notifications/requests and stray responses
    Rpc { message: Value },

    /// One line of diagnostic output; opaque text, never parsed
    Stderr { line: String },

    /// The process terminated; emitted exactly once per process instance
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Broadcast-based event bus
///
/// Cloning the bus shares the underlying channel; dropping a receiver
/// unsubscribes it, which is safe at any point including inside a handler.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers
    ///
    /// Returns the number of subscribers the event was delivered to; zero
    /// when nobody is listening, which is not an error.
    pub fn publish(&self, event: ServerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_arrive_in_production_order() {
        let bus = EventBus::default();
        let mut subscriber = bus.subscribe();

        bus.publish(ServerEvent::Stderr {
            line: "one".to_string(),
        });
        bus.publish(ServerEvent::Rpc {
            message: json!({"method": "two"}),
        });
        bus.publish(ServerEvent::Exit {
            code: Some(0),
            signal: None,
        });

        assert!(matches!(
            subscriber.recv().await.unwrap(),
            ServerEvent::Stderr { line } if line == "one"
        ));
        assert!(matches!(
            subscriber.recv().await.unwrap(),
            ServerEvent::Rpc { .. }
        ));
        assert!(matches!(
            subscriber.recv().await.unwrap(),
            ServerEvent::Exit { code: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(
            bus.publish(ServerEvent::Stderr {
                line: "shared".to_string()
            }),
            2
        );

        assert!(matches!(first.recv().await.unwrap(), ServerEvent::Stderr { .. }));
        assert!(matches!(second.recv().await.unwrap(), ServerEvent::Stderr { .. }));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_prior_events() {
        let bus = EventBus::default();
        let _early = bus.subscribe();

        bus.publish(ServerEvent::Stderr {
            line: "before".to_string(),
        });

        let mut late = bus.subscribe();
        bus.publish(ServerEvent::Stderr {
            line: "after".to_string(),
        });

        assert!(matches!(
            late.recv().await.unwrap(),
            ServerEvent::Stderr { line } if line == "after"
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(
            bus.publish(ServerEvent::Exit {
                code: None,
                signal: Some(9)
            }),
            0
        );
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ServerEvent::Exit {
            code: Some(3),
            signal: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("exit"));
        assert_eq!(value["code"], json!(3));
    }
}
