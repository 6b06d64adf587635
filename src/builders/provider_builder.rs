//! Builder wiring stores, queues, launchers and the dispatcher into a
//! [`ProviderService`].

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::ProviderConfig;
use crate::core::{
    AccountQueueDispatcher, AppResult, DurableQueue, Integration, ProcessorDeps, ProviderError, ScratchCache, Spawn,
    TokenCache, TokenStore, WorkerLauncher,
};
use crate::infra::{InMemoryDurableQueue, InMemoryTokenStore};
use crate::runtime::{InProcessLauncher, ProcessLauncher, ProviderService, WorkerHost};

/// Assembles a [`ProviderService`].
///
/// Unset backends default to the in-memory ones. Workers run out of process
/// through `config.worker` unless a launcher or an in-process integration is
/// given.
pub struct ProviderBuilder {
    config: ProviderConfig,
    store: Option<Arc<dyn TokenStore>>,
    queue: Option<Arc<dyn DurableQueue>>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    integration: Option<Integration>,
}

impl ProviderBuilder {
    /// Start from a configuration.
    #[must_use]
    pub const fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            launcher: None,
            integration: None,
        }
    }

    /// Use a specific token store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific durable queue.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn DurableQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use a specific worker launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Run workers as tokio tasks hosting `integration`, sharing the
    /// service's store and queue.
    #[must_use]
    pub fn with_in_process_workers(mut self, integration: Integration) -> Self {
        self.integration = Some(integration);
        self
    }

    /// Configuration being built.
    #[must_use]
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Validate the configuration and assemble the service.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when validation fails or no way to launch workers was
    /// configured.
    pub fn build<S>(self, spawner: S) -> Result<ProviderService<S>, ProviderError>
    where
        S: Spawn + Send + Sync + 'static,
    {
        let Self {
            config,
            store,
            queue,
            launcher,
            integration,
        } = self;
        config.validate()?;

        let store: Arc<dyn TokenStore> = store.unwrap_or_else(|| Arc::new(InMemoryTokenStore::new()));
        let queue: Arc<dyn DurableQueue> = queue.unwrap_or_else(|| Arc::new(InMemoryDurableQueue::new()));
        let cache = TokenCache::new(config.cache.capacity, config.cache_ttl());

        let launcher: Arc<dyn WorkerLauncher> = match (launcher, integration, &config.worker) {
            (Some(launcher), _, _) => launcher,
            (None, Some(integration), _) => {
                let host = build_worker_host(&config, Arc::clone(&store), Arc::clone(&queue), integration);
                Arc::new(InProcessLauncher::new(Arc::new(host)))
            }
            (None, None, Some(command)) => Arc::new(ProcessLauncher::new(command.clone())),
            (None, None, None) => {
                return Err(ProviderError::InvalidConfig(
                    "no worker launcher: set `worker` or register an in-process integration".into(),
                ))
            }
        };

        let dispatcher = AccountQueueDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            cache.clone(),
            launcher,
            config.pool_settings(),
            spawner,
        );
        info!(
            app = %config.app_name,
            workers_per_account = config.workers_per_account,
            "provider assembled"
        );
        Ok(ProviderService::new(config, store, queue, cache, dispatcher))
    }
}

/// Worker-side host for an integrator worker binary.
///
/// The host gets its own token and scratch caches, as a separate process
/// would.
#[must_use]
pub fn build_worker_host(
    config: &ProviderConfig,
    store: Arc<dyn TokenStore>,
    queue: Arc<dyn DurableQueue>,
    integration: Integration,
) -> WorkerHost {
    WorkerHost::new(ProcessorDeps {
        store,
        queue,
        integration,
        token_cache: TokenCache::new(config.cache.capacity, config.cache_ttl()),
        scratch: ScratchCache::new(config.cache.capacity, config.cache_ttl()),
    })
}

/// Worker host configured through [`ProviderConfig::from_env`], for the `main`
/// of an integrator worker binary.
///
/// # Errors
///
/// The environment configuration cannot be loaded or does not validate.
pub fn worker_host_from_env(
    store: Arc<dyn TokenStore>,
    queue: Arc<dyn DurableQueue>,
    integration: Integration,
) -> AppResult<WorkerHost> {
    let config = ProviderConfig::from_env().context("loading worker configuration")?;
    Ok(build_worker_host(&config, store, queue, integration))
}
