//! Volatile store for development, tests and servers that accept losing
//! allocations on restart.

use crate::core::{Allocation, AllocationStore, BrokerError, OwnerChange, RecordOp};
use crate::infra::store::StoreTables;
use crate::util::{AllocId, TargetId};

/// Store keeping everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: StoreTables,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AllocationStore for InMemoryStore {
    fn apply(
        &mut self,
        owners: &[OwnerChange],
        records: Vec<RecordOp>,
    ) -> Result<bool, BrokerError> {
        if !self.tables.expectations_hold(owners) {
            return Ok(false);
        }
        self.tables.apply_unchecked(owners, records);
        Ok(true)
    }

    fn get(&self, id: &AllocId) -> Option<&Allocation> {
        self.tables.get(id)
    }

    fn allocations(&self) -> Vec<&Allocation> {
        self.tables.allocations()
    }

    fn owner_of(&self, target: &str) -> Option<&AllocId> {
        self.tables.owner_of(target)
    }

    fn owners(&self) -> Vec<(TargetId, AllocId)> {
        self.tables.owners()
    }
}
