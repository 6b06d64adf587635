//! Handler operations of the provider, framework-free.
//!
//! Every operation returns a typed answer or a [`ProviderError`] whose
//! [`status_code`](ProviderError::status_code) is the HTTP status to send.
//! Success statuses are documented per operation.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::core::{
    AccountQueueDispatcher, DispatchStatus, DurableQueue, ProviderError, QueueDepth, QueueJob, Spawn, TempToken,
    TokenCache, TokenState, TokenStore, UpdateJob,
};
use crate::infra::store::InMemoryTempTokenStore;
use crate::util::now_ms;

/// Where the user lands after connecting when no `return_to` is given.
pub const DEFAULT_RETURN_TO: &str = "https://manager.anyfetch.com";

/// Body of an update request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Access identifier of the token.
    pub access_token: String,
    /// Per sub-queue cap on enqueued tasks.
    #[serde(default)]
    pub documents_per_update: Option<usize>,
    /// Reprovision a single document.
    #[serde(default)]
    pub identifier: Option<String>,
    /// Bypass a held lock.
    #[serde(default)]
    pub force: bool,
}

/// Answer to an accepted update (202).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAccepted {
    /// A stale or forced lock was overridden.
    pub forced_restart: bool,
    /// A new pool was started for the account.
    pub pool_started: bool,
}

/// Token snapshot (200).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    /// Account name.
    pub account_name: String,
    /// Current state.
    pub state: String,
    /// Service data.
    pub data: Value,
    /// Resume cursor.
    pub cursor: Option<Value>,
    /// Update lock held.
    pub is_updating: bool,
    /// Last update start, in milliseconds since the epoch.
    pub last_update_ms: Option<u64>,
    /// Credentials need a refresh.
    pub require_refresh: bool,
    /// A pool currently serves the account.
    pub pool_active: bool,
}

/// Depth of one account queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Queue name.
    pub queue: String,
    /// Jobs waiting to run.
    pub ready: usize,
    /// Jobs waiting for a retry delay.
    pub delayed: usize,
    /// Jobs being processed.
    pub in_flight: usize,
    /// A pool currently consumes the queue.
    pub active: bool,
}

/// The provider's handler operations.
pub struct ProviderService<S> {
    config: ProviderConfig,
    store: Arc<dyn TokenStore>,
    queue: Arc<dyn DurableQueue>,
    cache: TokenCache,
    temp_tokens: InMemoryTempTokenStore,
    dispatcher: AccountQueueDispatcher<S>,
    admission: AsyncMutex<()>,
}

impl<S> ProviderService<S>
where
    S: Spawn + Send + Sync + 'static,
{
    /// Assemble a service. See [`crate::builders::ProviderBuilder`].
    pub fn new(
        config: ProviderConfig,
        store: Arc<dyn TokenStore>,
        queue: Arc<dyn DurableQueue>,
        cache: TokenCache,
        dispatcher: AccountQueueDispatcher<S>,
    ) -> Self {
        let temp_tokens = InMemoryTempTokenStore::new(config.temp_token_ttl());
        Self {
            config,
            store,
            queue,
            cache,
            temp_tokens,
            dispatcher,
            admission: AsyncMutex::new(()),
        }
    }

    /// Schedule an update cycle (202).
    ///
    /// Locks the token unless a single document is requested, enqueues the
    /// update job and makes sure a pool serves the account.
    ///
    /// # Errors
    ///
    /// `Validation` (400) without a positive `documents_per_update` or an
    /// `identifier`, `UnknownToken` (404), `AlreadyProcessing` (429),
    /// `RequireRefresh` (428), store and queue failures (500). A failed push
    /// releases the lock it took.
    pub async fn schedule_update(&self, request: UpdateRequest) -> Result<UpdateAccepted, ProviderError> {
        if request.access_token.is_empty() {
            return Err(ProviderError::Validation("missing access_token".into()));
        }
        let cap_missing = matches!(request.documents_per_update, None | Some(0));
        if cap_missing && request.identifier.is_none() {
            return Err(ProviderError::Validation(
                "missing documents_per_update or identifier parameter".into(),
            ));
        }

        let job = UpdateJob {
            access_token: request.access_token,
            documents_per_update: request.documents_per_update,
            identifier: request.identifier,
            force: request.force,
        };

        let (token, admission) = {
            let _admission = self.admission.lock().await;
            let mut token = self
                .store
                .find_by_access_token(&job.access_token)
                .await?
                .ok_or(ProviderError::UnknownToken)?;
            let now = now_ms();
            let admission = token.admit_update(now, self.config.stale_threshold(), job.force)?;
            let unlocked = token.clone();
            let locks = !job.is_single_document();
            if locks {
                token.begin_update(now);
                self.store.save(&token).await?;
            }

            let queue_name = self.dispatcher.settings().queue_name(&token.account_name);
            match self
                .queue
                .push(&queue_name, QueueJob::Update(job), self.config.update_policy())
                .await
            {
                Ok(job_id) => info!(account = %token.account_name, job_id = %job_id, "update scheduled"),
                Err(err) => {
                    if locks {
                        // No job will ever release the lock.
                        if let Err(save) = self.store.save(&unlocked).await {
                            error!(account = %token.account_name, error = %save, "failed to release update lock");
                        }
                    }
                    return Err(err);
                }
            }
            (token, admission)
        };

        if admission.is_forced() {
            warn!(account = %token.account_name, "update lock overridden, restarting update");
        }

        let account = token.account_name.clone();
        let status = self
            .dispatcher
            .dispatch(
                &token.access_token,
                Box::new(move |outcome| debug!(account = %account, ?outcome, "dispatch settled")),
            )
            .await?;

        Ok(UpdateAccepted {
            forced_restart: admission.is_forced(),
            pool_started: status == DispatchStatus::Started,
        })
    }

    /// Clear the cursor, the lock and the refresh flag (204).
    ///
    /// # Errors
    ///
    /// `UnknownToken` (404), store failures (500).
    pub async fn reset(&self, access_token: &str) -> Result<(), ProviderError> {
        let _admission = self.admission.lock().await;
        let mut token = self
            .store
            .find_by_access_token(access_token)
            .await?
            .ok_or(ProviderError::UnknownToken)?;
        token.reset();
        self.store.save(&token).await?;
        self.cache.remove(access_token);
        info!(account = %token.account_name, "token reset");
        Ok(())
    }

    /// Kill the account pool, purge its queue and delete the token (204).
    ///
    /// # Errors
    ///
    /// `UnknownToken` (404), store and queue failures (500).
    pub async fn revoke(&self, access_token: &str) -> Result<(), ProviderError> {
        let token = self
            .store
            .find_by_access_token(access_token)
            .await?
            .ok_or(ProviderError::UnknownToken)?;
        let killed = self.dispatcher.kill(access_token).await?;
        if !killed {
            let queue_name = self.dispatcher.settings().queue_name(&token.account_name);
            self.queue.purge(&queue_name).await?;
        }
        self.cache.remove(access_token);
        self.store.remove(access_token).await?;
        info!(account = %token.account_name, pool_killed = killed, "token revoked");
        Ok(())
    }

    /// Snapshot of one token (200).
    ///
    /// # Errors
    ///
    /// `UnknownToken` (404), store failures (500).
    pub async fn status(&self, access_token: &str) -> Result<TokenStatus, ProviderError> {
        let token = self
            .store
            .find_by_access_token(access_token)
            .await?
            .ok_or(ProviderError::UnknownToken)?;
        let state = match token.state() {
            TokenState::Idle => "idle",
            TokenState::Updating => "updating",
            TokenState::RequireRefresh => "require_refresh",
        };
        Ok(TokenStatus {
            account_name: token.account_name,
            state: state.into(),
            data: token.data,
            cursor: token.cursor,
            is_updating: token.is_updating,
            last_update_ms: token.last_update_ms,
            require_refresh: token.require_refresh,
            pool_active: self.dispatcher.is_active(access_token),
        })
    }

    /// Depth of every known account queue (200).
    ///
    /// # Errors
    ///
    /// Queue failures (500).
    pub async fn queue_status(&self) -> Result<Vec<QueueStatus>, ProviderError> {
        let names = self.queue.queues().await?;
        let active = self.dispatcher.active_queues();
        let depths = join_all(names.iter().map(|name| self.queue.depth(name))).await;
        names
            .into_iter()
            .zip(depths)
            .map(|(queue, depth)| -> Result<QueueStatus, ProviderError> {
                let QueueDepth {
                    ready,
                    delayed,
                    in_flight,
                } = depth?;
                let active = active.contains(&queue);
                Ok(QueueStatus {
                    queue,
                    ready,
                    delayed,
                    in_flight,
                    active,
                })
            })
            .collect()
    }

    /// First leg of the connection handshake: remember `code` (204).
    ///
    /// # Errors
    ///
    /// `Validation` (400) when `code` is empty.
    pub fn connect(&self, code: &str, return_to: Option<String>, data: Value) -> Result<(), ProviderError> {
        if code.is_empty() {
            return Err(ProviderError::Validation("missing code parameter".into()));
        }
        self.temp_tokens.insert(TempToken {
            code: code.to_string(),
            return_to: return_to.unwrap_or_else(|| DEFAULT_RETURN_TO.to_string()),
            data,
            created_at_ms: now_ms(),
        });
        debug!("connection handshake started");
        Ok(())
    }

    /// Second leg: consume `code` and persist the new token. Returns the URL
    /// to redirect the user to (302).
    ///
    /// # Errors
    ///
    /// `Validation` (400) for an unknown, used or expired code; store
    /// failures (500).
    pub async fn complete_connect(
        &self,
        code: &str,
        account_name: &str,
        service_data: Value,
        access_token: &str,
    ) -> Result<String, ProviderError> {
        if code.is_empty() {
            return Err(ProviderError::Validation("missing code parameter".into()));
        }
        let temp = self
            .temp_tokens
            .take(code)
            .ok_or_else(|| ProviderError::Validation("unknown or expired code".into()))?;
        let token = crate::core::Token::new(access_token, account_name, service_data);
        self.store.save(&token).await?;
        info!(account = %account_name, "account connected");
        Ok(temp.return_to)
    }

    /// Drain every account pool and stop dispatching (graceful shutdown).
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    /// Pool registry.
    #[must_use]
    pub const fn dispatcher(&self) -> &AccountQueueDispatcher<S> {
        &self.dispatcher
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }
}
