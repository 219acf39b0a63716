//! Allocation store abstraction.
//!
//! The store holds the live allocation records and the per-target ownership
//! pointers. Every mutation goes through [`AllocationStore::apply`], which is
//! all-or-nothing: ownership expectations are checked first and, if any of
//! them fails, nothing is written.

use serde::{Deserialize, Serialize};

use crate::core::{Allocation, BrokerError};
use crate::util::{AllocId, TargetId};

/// Compare-and-set of one target's ownership pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerChange {
    /// Target whose pointer changes.
    pub target: TargetId,
    /// Owner the pointer must currently hold.
    pub expected: Option<AllocId>,
    /// Owner to write.
    pub new: Option<AllocId>,
}

impl OwnerChange {
    /// Claim a free target for `owner`.
    #[must_use]
    pub fn claim(target: impl Into<TargetId>, owner: &AllocId) -> Self {
        Self {
            target: target.into(),
            expected: None,
            new: Some(owner.clone()),
        }
    }

    /// Release a target held by `owner`.
    #[must_use]
    pub fn release(target: impl Into<TargetId>, owner: &AllocId) -> Self {
        Self {
            target: target.into(),
            expected: Some(owner.clone()),
            new: None,
        }
    }
}

/// Record mutation applied together with ownership changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOp {
    /// Insert or overwrite a record.
    Put(Allocation),
    /// Drop a record.
    Delete(AllocId),
}

/// Durable map of allocation id → record and target id → owner.
pub trait AllocationStore: Send {
    /// Atomically apply ownership compare-and-sets and record mutations.
    ///
    /// Returns `Ok(false)` without touching anything if an expectation does
    /// not hold.
    fn apply(&mut self, owners: &[OwnerChange], records: Vec<RecordOp>)
        -> Result<bool, BrokerError>;

    /// Fetch a live record.
    fn get(&self, id: &AllocId) -> Option<&Allocation>;

    /// All live records, in no particular order.
    fn allocations(&self) -> Vec<&Allocation>;

    /// Current owner of `target`.
    fn owner_of(&self, target: &str) -> Option<&AllocId>;

    /// Every ownership pointer that is set.
    fn owners(&self) -> Vec<(TargetId, AllocId)>;

    /// Insert or overwrite a record without ownership changes.
    fn put(&mut self, alloc: Allocation) -> Result<(), BrokerError> {
        self.apply(&[], vec![RecordOp::Put(alloc)]).map(|_| ())
    }

    /// True if a live record exists.
    fn contains(&self, id: &AllocId) -> bool {
        self.get(id).is_some()
    }
}

impl<S: AllocationStore + ?Sized> AllocationStore for Box<S> {
    fn apply(
        &mut self,
        owners: &[OwnerChange],
        records: Vec<RecordOp>,
    ) -> Result<bool, BrokerError> {
        (**self).apply(owners, records)
    }

    fn get(&self, id: &AllocId) -> Option<&Allocation> {
        (**self).get(id)
    }

    fn allocations(&self) -> Vec<&Allocation> {
        (**self).allocations()
    }

    fn owner_of(&self, target: &str) -> Option<&AllocId> {
        (**self).owner_of(target)
    }

    fn owners(&self) -> Vec<(TargetId, AllocId)> {
        (**self).owners()
    }
}
