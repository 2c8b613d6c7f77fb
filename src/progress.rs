//! One-way progress reporting for long-running operations (import,
//! export, sync, gc), identified by an opaque client token.
//!
//! Grounded on the original's `sse_service.py`/`sse_utils.py` (which
//! push progress as server-sent events to a browser). This crate has
//! no HTTP surface, so the transport is dropped and only the pub/sub
//! core survives: a broadcast channel subscribers can tail without
//! blocking producers, per the concurrency model's "subscribers do not
//! block producers" rule.

use tokio::sync::broadcast;

/// A single progress update. Percent is monotonic within one `token`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub token: String,
    pub percent: u8,
    pub message: String,
}

/// Broadcast hub for [`ProgressEvent`]s. Cloning shares the same
/// underlying channel; publishing when there are no subscribers is a
/// harmless no-op.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publish an update. Percent is clamped to 0..=100.
    pub fn publish(&self, token: &str, percent: u8, message: impl Into<String>) {
        let event = ProgressEvent {
            token: token.to_string(),
            percent: percent.min(100),
            message: message.into(),
        };
        // No subscribers is not an error: producers never block on delivery.
        let _ = self.sender.send(event);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = ProgressBus::default();
        let mut rx = bus.subscribe();
        bus.publish("tok-1", 50, "halfway");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.token, "tok-1");
        assert_eq!(event.percent, 50);
        assert_eq!(event.message, "halfway");
    }

    #[tokio::test]
    async fn percent_is_clamped_to_100() {
        let bus = ProgressBus::default();
        let mut rx = bus.subscribe();
        bus.publish("tok-1", 250, "overshoot");
        assert_eq!(rx.recv().await.unwrap().percent, 100);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = ProgressBus::default();
        bus.publish("tok-1", 10, "nobody listening");
    }
}
