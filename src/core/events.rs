//! State-change notifications for callers that would rather not poll.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{AllocState, EndReason};
use crate::util::AllocId;

/// A state transition of one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEvent {
    /// Allocation that changed.
    pub allocid: AllocId,
    /// State entered.
    pub state: AllocState,
    /// Granted group when the new state is active.
    pub group_allocated: Option<String>,
    /// Why the allocation ended, for terminal states.
    pub end_reason: Option<EndReason>,
}

/// Fan-out of allocation events to any number of subscribers.
///
/// Disconnected subscribers are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<AllocationEvent>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Receiver<AllocationEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver events to every live subscriber.
    pub fn publish(&self, events: &[AllocationEvent]) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
