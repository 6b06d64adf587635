//! In-memory durable queue with retries, backoff and reservation leases.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::core::{
    DurableQueue, FailureDisposition, JobId, ProviderError, QueueDepth, QueueJob, ReservedJob,
    RetryPolicy,
};

/// Extra time a reservation survives past the job timeout before the job is
/// presumed lost with its consumer.
pub const DEFAULT_LEASE_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct StoredJob {
    id: JobId,
    job: QueueJob,
    policy: RetryPolicy,
    failed_attempts: u32,
}

#[derive(Debug)]
struct Leased {
    job: StoredJob,
    lease_until: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredJob>,
    delayed: Vec<(Instant, StoredJob)>,
    in_flight: HashMap<JobId, Leased>,
}

impl QueueState {
    fn depth(&self) -> QueueDepth {
        QueueDepth {
            ready: self.ready.len(),
            delayed: self.delayed.len(),
            in_flight: self.in_flight.len(),
        }
    }

    /// Schedule another attempt or drop the job.
    fn retry_or_drop(&mut self, mut job: StoredJob, retryable: bool, now: Instant) -> FailureDisposition {
        job.failed_attempts += 1;
        if retryable && job.failed_attempts < job.policy.attempts {
            let delay = job.policy.delay_for(job.failed_attempts);
            self.delayed.push((now + delay, job));
            FailureDisposition::Retrying { delay }
        } else {
            warn!(job_id = %job.id, attempts = job.failed_attempts, "job dropped after final attempt");
            FailureDisposition::Exhausted
        }
    }

    /// Move due retries to the ready list and reclaim expired reservations.
    fn promote(&mut self, now: Instant) {
        let expired: Vec<JobId> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.lease_until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(leased) = self.in_flight.remove(&id) {
                warn!(job_id = %id, "reservation expired, consumer presumed lost");
                self.retry_or_drop(leased.job, true, now);
            }
        }

        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let due_count = self.delayed.iter().take_while(|(due, _)| *due <= now).count();
        for (_, job) in self.delayed.drain(..due_count) {
            self.ready.push_back(job);
        }
    }
}

/// Process-local [`DurableQueue`] for development, embedding and tests.
pub struct InMemoryDurableQueue {
    lease_grace: Duration,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl Default for InMemoryDurableQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurableQueue {
    /// Create an empty queue store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lease_grace(DEFAULT_LEASE_GRACE)
    }

    /// Create an empty queue store with a custom lease grace period.
    #[must_use]
    pub fn with_lease_grace(lease_grace: Duration) -> Self {
        Self {
            lease_grace,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Jobs currently ready on `queue`, in reservation order.
    #[must_use]
    pub fn snapshot(&self, queue: &str) -> Vec<QueueJob> {
        self.queues
            .lock()
            .get(queue)
            .map(|state| state.ready.iter().map(|stored| stored.job.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableQueue for InMemoryDurableQueue {
    async fn push(&self, queue: &str, job: QueueJob, policy: RetryPolicy) -> Result<JobId, ProviderError> {
        let id = Uuid::new_v4();
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredJob {
                id,
                job,
                policy,
                failed_attempts: 0,
            });
        Ok(id)
    }

    async fn reserve(&self, queue: &str) -> Result<Option<ReservedJob>, ProviderError> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        state.promote(now);
        let Some(stored) = state.ready.pop_front() else {
            return Ok(None);
        };
        let reserved = ReservedJob {
            id: stored.id,
            queue: queue.to_string(),
            job: stored.job.clone(),
            policy: stored.policy,
            attempt: stored.failed_attempts + 1,
        };
        let lease_until = now + stored.policy.timeout() + self.lease_grace;
        state.in_flight.insert(stored.id, Leased { job: stored, lease_until });
        Ok(Some(reserved))
    }

    async fn complete(&self, queue: &str, id: JobId) -> Result<(), ProviderError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| ProviderError::Queue(format!("unknown queue {queue}")))?;
        state
            .in_flight
            .remove(&id)
            .ok_or_else(|| ProviderError::Queue(format!("job {id} is not reserved")))?;
        if state.depth().is_drained() {
            queues.remove(queue);
        }
        Ok(())
    }

    async fn fail(&self, queue: &str, id: JobId, retryable: bool) -> Result<FailureDisposition, ProviderError> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| ProviderError::Queue(format!("unknown queue {queue}")))?;
        let leased = state
            .in_flight
            .remove(&id)
            .ok_or_else(|| ProviderError::Queue(format!("job {id} is not reserved")))?;
        let disposition = state.retry_or_drop(leased.job, retryable, now);
        if state.depth().is_drained() {
            queues.remove(queue);
        }
        Ok(disposition)
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, ProviderError> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        Ok(queues.get_mut(queue).map_or_else(QueueDepth::default, |state| {
            state.promote(now);
            state.depth()
        }))
    }

    async fn purge(&self, queue: &str) -> Result<usize, ProviderError> {
        Ok(self
            .queues
            .lock()
            .remove(queue)
            .map_or(0, |state| state.depth().total()))
    }

    async fn queues(&self) -> Result<Vec<String>, ProviderError> {
        let mut names: Vec<String> = self
            .queues
            .lock()
            .iter()
            .filter(|(_, state)| !state.depth().is_drained())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskJob, UpdateJob};
    use serde_json::json;

    fn task(n: u64) -> QueueJob {
        QueueJob::Task(TaskJob {
            access_token: "tok".into(),
            task_type: "additions".into(),
            payload: json!({ "identifier": n }),
        })
    }

    fn policy(attempts: u32, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay_ms,
            exponential: false,
            timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn reserves_in_push_order() {
        let queue = InMemoryDurableQueue::new();
        for n in 0..3 {
            queue.push("acc", task(n), policy(1, 0)).await.unwrap();
        }
        for n in 0..3 {
            let reserved = queue.reserve("acc").await.unwrap().unwrap();
            assert_eq!(reserved.job, task(n));
            assert_eq!(reserved.attempt, 1);
            queue.complete("acc", reserved.id).await.unwrap();
        }
        assert!(queue.reserve("acc").await.unwrap().is_none());
        assert!(queue.depth("acc").await.unwrap().is_drained());
        assert!(queue.queues().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_retried_after_delay() {
        let queue = InMemoryDurableQueue::new();
        queue.push("acc", task(1), policy(2, 500)).await.unwrap();

        let first = queue.reserve("acc").await.unwrap().unwrap();
        let disposition = queue.fail("acc", first.id, true).await.unwrap();
        assert_eq!(disposition, FailureDisposition::Retrying { delay: Duration::from_millis(500) });
        assert!(queue.reserve("acc").await.unwrap().is_none());
        assert_eq!(queue.depth("acc").await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        let second = queue.reserve("acc").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert_eq!(queue.fail("acc", second.id, true).await.unwrap(), FailureDisposition::Exhausted);
        assert!(queue.depth("acc").await.unwrap().is_drained());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_dropped() {
        let queue = InMemoryDurableQueue::new();
        queue.push("acc", task(1), policy(5, 0)).await.unwrap();
        let reserved = queue.reserve("acc").await.unwrap().unwrap();
        assert_eq!(queue.fail("acc", reserved.id, false).await.unwrap(), FailureDisposition::Exhausted);
        assert!(queue.reserve("acc").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_reservation_is_reclaimed() {
        let queue = InMemoryDurableQueue::with_lease_grace(Duration::from_millis(100));
        queue.push("acc", task(1), policy(3, 0)).await.unwrap();
        let lost = queue.reserve("acc").await.unwrap().unwrap();
        assert_eq!(queue.depth("acc").await.unwrap().in_flight, 1);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let again = queue.reserve("acc").await.unwrap().unwrap();
        assert_eq!(again.id, lost.id);
        assert_eq!(again.attempt, 2);
        assert!(queue.complete("acc", lost.id).await.is_ok());
    }

    #[tokio::test]
    async fn purge_drops_everything() {
        let queue = InMemoryDurableQueue::new();
        queue
            .push(
                "acc",
                QueueJob::Update(UpdateJob {
                    access_token: "tok".into(),
                    documents_per_update: Some(5),
                    identifier: None,
                    force: false,
                }),
                policy(1, 0),
            )
            .await
            .unwrap();
        queue.push("acc", task(1), policy(1, 0)).await.unwrap();
        queue.reserve("acc").await.unwrap().unwrap();
        assert_eq!(queue.purge("acc").await.unwrap(), 2);
        assert_eq!(queue.purge("acc").await.unwrap(), 0);
        assert!(queue.snapshot("acc").is_empty());
    }
}
