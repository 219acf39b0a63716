//! Background sweeper driving [`AllocationEngine::maintenance`].
//!
//! The sweeper sleeps until the engine's next deadline (bounded by the
//! configured interval) or until the engine raises its [`SweepSignal`],
//! whichever comes first.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::{AllocationEngine, AllocationQueue, AllocationStore, SweepSignal, Wake};
use crate::util::now_ms;

// Floor on the wait so an unclearable deadline cannot spin the loop.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Run one maintenance pass and log its outcome.
pub fn run_once<St, Q>(engine: &AllocationEngine<St, Q>)
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    match engine.maintenance(now_ms()) {
        Ok(report) if report != crate::core::MaintenanceReport::default() => {
            tracing::debug!(?report, "maintenance pass");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "maintenance pass failed"),
    }
}

/// Time to sleep before the next pass.
pub fn next_wait<St, Q>(engine: &AllocationEngine<St, Q>, interval: Duration) -> Duration
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    let now = now_ms();
    let wait = match engine.next_deadline_ms() {
        Some(at) if at > now => {
            Duration::from_millis(u64::try_from(at - now).unwrap_or(u64::MAX)).min(interval)
        }
        Some(_) => Duration::ZERO,
        None => interval,
    };
    wait.max(MIN_WAIT)
}

/// Blocking sweeper loop; returns once the engine's signal is shut down.
pub fn sweeper_loop<St, Q>(engine: &AllocationEngine<St, Q>, interval: Duration)
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    let signal = engine.signal();
    loop {
        match signal.wait(next_wait(engine, interval)) {
            Wake::Shutdown => {
                tracing::info!("sweeper shutting down");
                break;
            }
            Wake::Notified | Wake::Timeout => run_once(engine),
        }
    }
}

/// Handle to a sweeper thread; shuts it down when dropped.
pub struct SweeperHandle {
    signal: Arc<SweepSignal>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Ask the sweeper to run now.
    pub fn wake(&self) {
        self.signal.notify();
    }

    /// Stop the sweeper and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.signal.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the blocking sweeper on a dedicated OS thread.
pub fn spawn_sweeper<St, Q>(
    engine: Arc<AllocationEngine<St, Q>>,
    interval: Duration,
) -> std::io::Result<SweeperHandle>
where
    St: AllocationStore + 'static,
    Q: AllocationQueue + 'static,
{
    let signal = engine.signal();
    let thread = std::thread::Builder::new()
        .name("broker-sweeper".into())
        .spawn(move || sweeper_loop(engine.as_ref(), interval))?;
    tracing::info!(interval_ms = %interval.as_millis(), "sweeper started");
    Ok(SweeperHandle {
        signal,
        thread: Some(thread),
    })
}

/// Async sweeper for servers already running on tokio. Polls the engine's
/// signal every `poll` and runs maintenance when notified or when the next
/// deadline is due.
#[cfg(feature = "tokio-runtime")]
pub fn spawn_tokio_sweeper<St, Q>(
    engine: Arc<AllocationEngine<St, Q>>,
    interval: Duration,
    poll: Duration,
    handle: &tokio::runtime::Handle,
) -> tokio::task::JoinHandle<()>
where
    St: AllocationStore + 'static,
    Q: AllocationQueue + 'static,
{
    handle.spawn(async move {
        let signal = engine.signal();
        let mut remaining = next_wait(engine.as_ref(), interval);
        loop {
            let step = remaining.min(poll.max(MIN_WAIT));
            tokio::time::sleep(step).await;
            if signal.is_shutdown() {
                tracing::info!("async sweeper shutting down");
                break;
            }
            remaining = remaining.saturating_sub(step);
            if signal.take_pending() || remaining.is_zero() {
                run_once(engine.as_ref());
                remaining = next_wait(engine.as_ref(), interval);
            }
        }
    })
}
