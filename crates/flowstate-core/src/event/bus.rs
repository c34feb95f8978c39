//! Broadcast event bus for `ExecutionEvent`s.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op; slow subscribers lag rather than block the engine.

use flowstate_types::event::ExecutionEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus shared by every execution of one engine.
///
/// Cloning the bus clones the sender.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers the event reached.
    pub fn publish(&self, event: ExecutionEvent) -> usize {
        let execution_id = event.execution_id();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::trace!(execution_id = %execution_id, receivers, "published event");
                receivers
            }
            Err(_) => 0,
        }
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
