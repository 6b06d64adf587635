//! Configuration models for account pools, queues, caches and workers.

pub mod provider;

pub use provider::{
    CacheConfig, ProviderConfig, RestartConfig, RetryConfig, WorkerCommand, DEFAULT_API_URL,
};
