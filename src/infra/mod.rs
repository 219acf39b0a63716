//! Infrastructure adapters for the wait queue and allocation storage.

pub mod queue;
pub mod store;

pub use queue::WaitQueue;
pub use store::{FileStore, InMemoryStore};
