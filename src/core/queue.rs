//! Wait-queue abstraction consumed by the engine.

use std::cmp::Ordering;

use crate::core::BrokerError;
use crate::util::AllocId;

/// A pending allocation waiting for one of its groups to free up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Pending allocation.
    pub alloc: AllocId,
    /// Normalized priority: lower ranks are served first.
    pub rank: i64,
    /// Arrival sequence, breaks ties between equal ranks.
    pub seq: u64,
    /// Enqueue time in milliseconds since epoch.
    pub enqueued_at_ms: u128,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Most urgent first, then earliest arrival; the id only makes the
        // order total.
        self.rank
            .cmp(&other.rank)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| self.alloc.cmp(&other.alloc))
    }
}

/// Abstraction for wait-queue backends.
pub trait AllocationQueue: Send {
    /// Insert an entry; re-inserting the same allocation replaces it.
    fn push(&mut self, entry: QueueEntry) -> Result<(), BrokerError>;
    /// Remove an allocation from the queue.
    fn remove(&mut self, alloc: &AllocId) -> Option<QueueEntry>;
    /// True if the allocation is waiting.
    fn contains(&self, alloc: &AllocId) -> bool;
    /// Snapshot of waiting allocations in service order.
    fn ordered(&self) -> Vec<AllocId>;
    /// Maximum depth allowed for this queue.
    fn max_depth(&self) -> usize;
    /// Current depth.
    fn len(&self) -> usize;
    /// True when nothing waits.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
