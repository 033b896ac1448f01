//! Event bus for deliberation progress.
//!
//! Pub/sub over a Tokio broadcast channel with a bounded in-memory history
//! ring so a finished session's event stream can still be inspected.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::DeliberationEvent;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 256;

/// How many past events the bus retains.
const HISTORY_CAPACITY: usize = 1024;

/// Shared reference to an EventBus.
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast delivery and bounded history.
pub struct EventBus {
    sender: broadcast::Sender<DeliberationEvent>,
    history: Mutex<VecDeque<DeliberationEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. Publishing never fails on a
    /// quiet bus: no receivers is fine, history is still recorded. A slow
    /// subscriber observes `Lagged` on its receiver; it never blocks emit.
    pub fn publish(&self, event: DeliberationEvent) {
        let event_type = event.event_type();

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    /// Subscribe to receive events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliberationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// All retained events, oldest first.
    pub fn history(&self) -> Vec<DeliberationEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Retained events for one session, oldest first.
    pub fn session_history(&self, session_id: &str) -> Vec<DeliberationEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.session_id() == session_id)
            .cloned()
            .collect()
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
    use chrono::Utc;

    fn started(session_id: &str) -> DeliberationEvent {
        DeliberationEvent::SessionStarted {
            session_id: session_id.to_string(),
            problem_preview: "p".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(started("s-1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s-1");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(started("s-1"));
        assert_eq!(bus.history().len(), 1);
    }

    #[test]
    fn test_session_history_filters() {
        let bus = EventBus::new();
        bus.publish(started("s-1"));
        bus.publish(started("s-2"));
        bus.publish(started("s-1"));
        assert_eq!(bus.session_history("s-1").len(), 2);
        assert_eq!(bus.session_history("s-2").len(), 1);
        assert!(bus.session_history("s-3").is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::new();
        for i in 0..(HISTORY_CAPACITY + 10) {
            bus.publish(started(&format!("s-{i}")));
        }
        let history = bus.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(history[0].session_id(), "s-10");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(started("s-1"));
        assert_eq!(rx1.recv().await.unwrap().session_id(), "s-1");
        assert_eq!(rx2.recv().await.unwrap().session_id(), "s-1");
    }
}
