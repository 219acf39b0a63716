//! In-memory wait queue ordered by priority rank, FIFO within a rank.

use std::collections::{BTreeSet, HashMap};

use crate::core::{AllocationQueue, BrokerError, QueueEntry};
use crate::util::AllocId;

/// Ordered queue with O(log n) insert and removal by id.
///
/// Sweeps walk it front to back without popping: an entry that still cannot
/// be admitted keeps its place.
#[derive(Debug)]
pub struct WaitQueue {
    max_depth: usize,
    entries: BTreeSet<QueueEntry>,
    index: HashMap<AllocId, QueueEntry>,
}

impl WaitQueue {
    /// Create an empty queue holding at most `max_depth` entries.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            entries: BTreeSet::new(),
            index: HashMap::new(),
        }
    }

    /// Zero-based position of an allocation in service order.
    #[must_use]
    pub fn position(&self, alloc: &AllocId) -> Option<usize> {
        let entry = self.index.get(alloc)?;
        Some(self.entries.range(..entry).count())
    }
}

impl AllocationQueue for WaitQueue {
    fn push(&mut self, entry: QueueEntry) -> Result<(), BrokerError> {
        if let Some(previous) = self.index.remove(&entry.alloc) {
            self.entries.remove(&previous);
        } else if self.len() >= self.max_depth {
            return Err(BrokerError::QueueFull(format!(
                "wait queue holds {} entries",
                self.len()
            )));
        }
        self.index.insert(entry.alloc.clone(), entry.clone());
        self.entries.insert(entry);
        Ok(())
    }

    fn remove(&mut self, alloc: &AllocId) -> Option<QueueEntry> {
        let entry = self.index.remove(alloc)?;
        self.entries.remove(&entry);
        Some(entry)
    }

    fn contains(&self, alloc: &AllocId) -> bool {
        self.index.contains_key(alloc)
    }

    fn ordered(&self) -> Vec<AllocId> {
        self.entries.iter().map(|e| e.alloc.clone()).collect()
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
