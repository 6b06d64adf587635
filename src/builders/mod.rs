//! Builders to assemble the provider and its worker hosts from configuration.

pub mod provider_builder;

pub use provider_builder::{build_worker_host, worker_host_from_env, ProviderBuilder};
