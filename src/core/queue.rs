//! Durable queue and token store abstractions.
//!
//! Both are external capabilities in production (a networked job store and a
//! document database). The core only depends on these traits.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{JobId, ProviderError, QueueJob, ReservedJob, RetryPolicy, Token};

/// What the queue did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Another attempt was scheduled after `delay`.
    Retrying {
        /// Delay before the job becomes ready again.
        delay: Duration,
    },
    /// No attempts remain; the job was dropped.
    Exhausted,
}

impl FailureDisposition {
    /// Whether another attempt is scheduled.
    #[must_use]
    pub const fn will_retry(self) -> bool {
        matches!(self, Self::Retrying { .. })
    }
}

/// Pending work on one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Jobs ready to be reserved.
    pub ready: usize,
    /// Jobs waiting for a retry delay.
    pub delayed: usize,
    /// Jobs reserved and not yet acknowledged.
    pub in_flight: usize,
}

impl QueueDepth {
    /// Total jobs still owned by the queue.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }

    /// No pending and no in-flight work.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.total() == 0
    }
}

/// Durable job store with per-job retry, delay and timeout.
#[async_trait]
pub trait DurableQueue: Send + Sync + 'static {
    /// Persist a job at the tail of `queue`.
    async fn push(&self, queue: &str, job: QueueJob, policy: RetryPolicy) -> Result<JobId, ProviderError>;

    /// Reserve the next ready job, if any. Never blocks waiting for work.
    async fn reserve(&self, queue: &str) -> Result<Option<ReservedJob>, ProviderError>;

    /// Acknowledge a reserved job.
    async fn complete(&self, queue: &str, id: JobId) -> Result<(), ProviderError>;

    /// Report a failed attempt. Non-retryable failures are dropped at once.
    async fn fail(&self, queue: &str, id: JobId, retryable: bool) -> Result<FailureDisposition, ProviderError>;

    /// Pending work on `queue`.
    async fn depth(&self, queue: &str) -> Result<QueueDepth, ProviderError>;

    /// Drop every job of `queue`, returning how many were removed.
    async fn purge(&self, queue: &str) -> Result<usize, ProviderError>;

    /// Names of all queues holding at least one job.
    async fn queues(&self) -> Result<Vec<String>, ProviderError>;
}

/// Keyed CRUD store for token records.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Find a token by its external access identifier.
    async fn find_by_access_token(&self, access_token: &str) -> Result<Option<Token>, ProviderError>;

    /// Insert or replace a token.
    async fn save(&self, token: &Token) -> Result<(), ProviderError>;

    /// Delete a token. Removing a missing token is not an error.
    async fn remove(&self, access_token: &str) -> Result<(), ProviderError>;
}
