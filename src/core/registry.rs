//! Target registry: the authoritative list of targets and their capability
//! tags. The engine only reads it.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::util::TargetId;

/// Static description of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Interface capability tags (`power`, `console`, `images`...).
    #[serde(default)]
    pub interfaces: BTreeSet<String>,
    /// Disabled targets are never granted.
    #[serde(default)]
    pub disabled: bool,
}

/// Read-only view of the target namespace consumed by the engine.
pub trait TargetRegistry: Send + Sync {
    /// True if the target is known.
    fn exists(&self, target: &str) -> bool;
    /// Capability tags of the target; empty for unknown targets.
    fn capabilities(&self, target: &str) -> BTreeSet<String>;
    /// True if the target exists but must not be handed out.
    fn is_disabled(&self, target: &str) -> bool;
}

/// Registry kept in memory, mutable by the surrounding server (never by the
/// engine).
#[derive(Debug, Default)]
pub struct InMemoryTargetRegistry {
    targets: RwLock<HashMap<TargetId, TargetInfo>>,
}

impl InMemoryTargetRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the given targets with no capabilities.
    #[must_use]
    pub fn from_ids<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TargetId>,
    {
        let registry = Self::new();
        for id in ids {
            registry.insert(id, TargetInfo::default());
        }
        registry
    }

    /// Add or replace a target.
    pub fn insert(&self, id: impl Into<TargetId>, info: TargetInfo) {
        self.targets.write().insert(id.into(), info);
    }

    /// Remove a target; queued allocations naming it get rejected on the
    /// next sweep.
    pub fn remove(&self, id: &str) -> Option<TargetInfo> {
        self.targets.write().remove(id)
    }

    /// Enable or disable a target. Returns false if it is unknown.
    pub fn set_disabled(&self, id: &str, disabled: bool) -> bool {
        self.targets.write().get_mut(id).is_some_and(|info| {
            info.disabled = disabled;
            true
        })
    }

    /// Known target ids.
    #[must_use]
    pub fn ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<_> = self.targets.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl TargetRegistry for InMemoryTargetRegistry {
    fn exists(&self, target: &str) -> bool {
        self.targets.read().contains_key(target)
    }

    fn capabilities(&self, target: &str) -> BTreeSet<String> {
        self.targets
            .read()
            .get(target)
            .map(|info| info.interfaces.clone())
            .unwrap_or_default()
    }

    fn is_disabled(&self, target: &str) -> bool {
        self.targets.read().get(target).is_some_and(|info| info.disabled)
    }
}
