//! Durable queue backends.

pub mod memory;

pub use memory::InMemoryDurableQueue;
