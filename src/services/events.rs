//! Typed notifications published after state changes commit.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ObjectUploaded {
        bucket_id: Uuid,
        key: String,
        version_id: Uuid,
        file_id: Uuid,
    },
    ObjectDeleted {
        bucket_id: Uuid,
        key: String,
        version_id: Uuid,
    },
    FileChecksumFailed {
        file_id: Uuid,
        expected: Option<String>,
        actual: String,
    },
}

/// Fan-out channel. Every subscriber receives every event published while
/// its receiver is alive; closed receivers are pruned on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<Event> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(?event, "publishing event");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_live_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        drop(second);

        let event = Event::FileChecksumFailed {
            file_id: Uuid::new_v4(),
            expected: Some("sha256:aa".into()),
            actual: "sha256:bb".into(),
        };
        bus.publish(event.clone());

        assert_eq!(first.recv().await, Some(event));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
