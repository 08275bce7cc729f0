//! Engine events pushed to UI consumers

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The assistant message text grew by one chunk
    #[serde(rename_all = "camelCase")]
    RevealChunk {
        conversation_id: String,
        message_id: String,
        text: String,
    },

    /// The viewport is pinned to the latest message and should follow it
    #[serde(rename_all = "camelCase")]
    ScrollToEnd { conversation_id: String },

    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        conversation_id: String,
        message_id: String,
        cancelled: bool,
    },

    #[serde(rename_all = "camelCase")]
    TitleUpdated {
        conversation_id: String,
        title: String,
    },
}

/// Fan-out of engine events. Sending never blocks and never fails when
/// nobody is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json() {
        let event = EngineEvent::MessageDelivered {
            conversation_id: "1".into(),
            message_id: "m".into(),
            cancelled: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message_delivered");
        assert_eq!(json["conversationId"], "1");
        assert_eq!(json["cancelled"], true);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::ScrollToEnd {
            conversation_id: "1".into(),
        });

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::ScrollToEnd {
            conversation_id: "2".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::ScrollToEnd {
                conversation_id: "2".into()
            }
        );
    }
}
