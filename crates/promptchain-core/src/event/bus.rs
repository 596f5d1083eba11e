//! Fan-out of execution lifecycle events.
//!
//! Controllers and step runners publish; the HTTP server's alert logger and
//! tests subscribe. Subscribers only see events published after they joined,
//! and a subscriber that falls more than `capacity` events behind skips ahead.

use promptchain_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Cloneable handle to one broadcast channel of `WorkflowEvent`s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Every attempt publishes one event, so size for the largest step
    /// budget times the number of executions running at once.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Deliver to current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
