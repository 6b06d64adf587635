//! Token store backends.

pub mod memory;

pub use memory::{InMemoryTempTokenStore, InMemoryTokenStore};
