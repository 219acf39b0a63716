//! Tokio runtime spawner and the async driver-hook adapter built on it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{DriverHook, Spawn};

/// Tokio-based spawner that executes tasks on a tokio runtime.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
    // Keeps an owned runtime alive; `None` when borrowing an existing one.
    _runtime: Option<Arc<tokio::runtime::Runtime>>,
}

impl TokioSpawner {
    /// Create a new `TokioSpawner` from a tokio runtime handle.
    #[must_use]
    pub const fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    /// Create a `TokioSpawner` owning a multi-threaded runtime with the given
    /// number of worker threads.
    pub fn with_worker_threads(worker_threads: usize) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("broker-driver")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(runtime)),
        })
    }

    /// Like [`TokioSpawner::with_worker_threads`], one worker per CPU.
    pub fn with_default_threads() -> Result<Self, std::io::Error> {
        Self::with_worker_threads(num_cpus::get())
    }

    /// Handle of the runtime tasks are spawned on.
    #[must_use]
    pub const fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}

/// Driver reaction that needs to await I/O (power controllers, consoles,
/// remote agents).
#[async_trait]
pub trait AsyncDriverHook: Send + Sync + 'static {
    /// Begin a graceful release of `target`.
    async fn notify_preempt(&self, target: String);
}

/// Adapts an [`AsyncDriverHook`] to the synchronous [`DriverHook`] the engine
/// calls, by spawning every notice onto `S`.
pub struct SpawnedDriverHook<H, S> {
    hook: Arc<H>,
    spawner: S,
}

impl<H, S> SpawnedDriverHook<H, S>
where
    H: AsyncDriverHook,
    S: Spawn,
{
    /// Wrap `hook`, running its notices on `spawner`.
    pub fn new(hook: H, spawner: S) -> Self {
        Self {
            hook: Arc::new(hook),
            spawner,
        }
    }
}

impl<H, S> DriverHook for SpawnedDriverHook<H, S>
where
    H: AsyncDriverHook,
    S: Spawn + Send + Sync,
{
    fn notify_preempt(&self, target: &str) {
        let hook = Arc::clone(&self.hook);
        let target = target.to_string();
        self.spawner.spawn(async move {
            tracing::debug!(target_id = %target, "async preemption notice");
            hook.notify_preempt(target).await;
        });
    }
}
