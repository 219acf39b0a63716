//! Hooks into the resource-specific driver layer.
//!
//! The engine never powers, flashes or reads a target. The only thing it
//! tells drivers is that a target is about to be handed to someone else, so
//! they can start quiescing it within the grace window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::core::TargetRegistry;

/// Driver-side reaction to a pending preemption.
///
/// Called outside the engine lock. Implementations must return quickly;
/// anything slow belongs on a spawned task (see
/// `runtime::tokio_spawner::SpawnedDriverHook`).
pub trait DriverHook: Send + Sync {
    /// Begin a graceful release of `target`.
    fn notify_preempt(&self, target: &str);
}

/// Abstraction for spawning driver work on a runtime.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Maps capability tags to the driver hook responsible for them.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    hooks: HashMap<String, Arc<dyn DriverHook>>,
    fallback: Option<Arc<dyn DriverHook>>,
}

impl DriverRegistry {
    /// Create a registry with no hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` for targets exposing `tag`.
    #[must_use]
    pub fn with_hook(mut self, tag: impl Into<String>, hook: Arc<dyn DriverHook>) -> Self {
        self.hooks.insert(tag.into(), hook);
        self
    }

    /// Hook notified for every target, whatever its tags.
    #[must_use]
    pub fn with_fallback(mut self, hook: Arc<dyn DriverHook>) -> Self {
        self.fallback = Some(hook);
        self
    }

    /// Fire-and-forget preemption notice for `target`.
    pub fn notify_preempt(&self, registry: &dyn TargetRegistry, target: &str) {
        for tag in registry.capabilities(target) {
            if let Some(hook) = self.hooks.get(&tag) {
                tracing::debug!(target_id = target, tag = %tag, "notifying driver of preemption");
                hook.notify_preempt(target);
            }
        }
        if let Some(hook) = &self.fallback {
            hook.notify_preempt(target);
        }
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("tags", &self.hooks.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
