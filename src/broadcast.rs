use crate::model::CheckResultEvent;
use serde_json::json;
use tokio::sync::broadcast;

/// Pushes check outcomes to live subscribers. Fire-and-forget.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: &CheckResultEvent);
}

/// Serializes events once and fans them out over a broadcast channel; the
/// SSE endpoint holds the receivers.
#[derive(Debug, Clone)]
pub struct LiveBroadcaster {
    tx: broadcast::Sender<String>,
}

impl LiveBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Broadcaster for LiveBroadcaster {
    fn publish(&self, event: &CheckResultEvent) {
        let message = json!({ "type": "check_result", "payload": event });
        // Err only means nobody is listening.
        let _ = self.tx.send(message.to_string());
    }
}
