//! Runtime adapters: the API surface, the background sweeper and the tokio
//! spawner.

pub mod api;
pub mod sweeper;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_spawner;

pub use api::{ApiError, AllocationCreated, AllocationRequest, AllocationView, Health};
pub use sweeper::{spawn_sweeper, SweeperHandle};
#[cfg(feature = "tokio-runtime")]
pub use tokio_spawner::{AsyncDriverHook, SpawnedDriverHook, TokioSpawner};
