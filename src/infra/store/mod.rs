//! Allocation store backends.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use std::collections::HashMap;

use crate::core::{Allocation, OwnerChange, RecordOp};
use crate::util::{AllocId, TargetId};

/// In-memory tables shared by every backend; durable backends journal the
/// operations before applying them here.
#[derive(Debug, Default, Clone)]
pub struct StoreTables {
    allocations: HashMap<AllocId, Allocation>,
    owners: HashMap<TargetId, AllocId>,
}

impl StoreTables {
    /// True if every expectation in `owners` holds.
    #[must_use]
    pub fn expectations_hold(&self, owners: &[OwnerChange]) -> bool {
        owners
            .iter()
            .all(|change| self.owners.get(&change.target) == change.expected.as_ref())
    }

    /// Apply changes that were already checked.
    pub fn apply_unchecked(&mut self, owners: &[OwnerChange], records: Vec<RecordOp>) {
        for change in owners {
            match &change.new {
                Some(owner) => {
                    self.owners.insert(change.target.clone(), owner.clone());
                }
                None => {
                    self.owners.remove(&change.target);
                }
            }
        }
        for op in records {
            match op {
                RecordOp::Put(alloc) => {
                    self.allocations.insert(alloc.id.clone(), alloc);
                }
                RecordOp::Delete(id) => {
                    self.allocations.remove(&id);
                }
            }
        }
    }

    /// Fetch a record.
    #[must_use]
    pub fn get(&self, id: &AllocId) -> Option<&Allocation> {
        self.allocations.get(id)
    }

    /// All records.
    #[must_use]
    pub fn allocations(&self) -> Vec<&Allocation> {
        self.allocations.values().collect()
    }

    /// Owner of one target.
    #[must_use]
    pub fn owner_of(&self, target: &str) -> Option<&AllocId> {
        self.owners.get(target)
    }

    /// All set ownership pointers, sorted by target.
    #[must_use]
    pub fn owners(&self) -> Vec<(TargetId, AllocId)> {
        let mut owners: Vec<_> = self
            .owners
            .iter()
            .map(|(t, a)| (t.clone(), a.clone()))
            .collect();
        owners.sort();
        owners
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// True when no record is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
