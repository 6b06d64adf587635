//! Infrastructure adapters for the durable queue and the token stores.

pub mod queue;
pub mod store;

pub use queue::InMemoryDurableQueue;
pub use store::{InMemoryTempTokenStore, InMemoryTokenStore};
