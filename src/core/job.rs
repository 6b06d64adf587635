//! Job payloads stored on the durable queue and the outcomes workers report.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::TaskError;

/// Identifier assigned by the durable queue.
pub type JobId = Uuid;

/// Attempt, backoff and timeout policy carried by every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub delay_ms: u64,
    /// Double the delay on every further retry.
    #[serde(default)]
    pub exponential: bool,
    /// Per-attempt execution timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl RetryPolicy {
    /// A single attempt with the given timeout.
    #[must_use]
    pub fn once(timeout: Duration) -> Self {
        Self {
            attempts: 1,
            delay_ms: 0,
            exponential: false,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay before retrying after `failed_attempts` failures (1-based).
    #[must_use]
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if !self.exponential || failed_attempts <= 1 {
            return Duration::from_millis(self.delay_ms);
        }
        let factor = 1u64.checked_shl(failed_attempts - 1).unwrap_or(u64::MAX);
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }

    /// Per-attempt timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Scheduled poll of the external source for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJob {
    /// Access identifier of the token to update.
    pub access_token: String,
    /// Per sub-queue cap on enqueued tasks. Ignored in single-document mode.
    #[serde(default)]
    pub documents_per_update: Option<usize>,
    /// Reprovision only the document with this identifier.
    #[serde(default)]
    pub identifier: Option<String>,
    /// The request bypassed a held lock.
    #[serde(default)]
    pub force: bool,
}

impl UpdateJob {
    /// Whether this job redelivers a single document.
    #[must_use]
    pub const fn is_single_document(&self) -> bool {
        self.identifier.is_some()
    }
}

/// Delivery or deletion of exactly one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskJob {
    /// Access identifier of the owning token.
    pub access_token: String,
    /// Registered task type (sub-queue name).
    pub task_type: String,
    /// Opaque item pushed by the generator.
    pub payload: Value,
}

/// Everything the durable queue carries for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueJob {
    /// Delta retrieval for the account.
    Update(UpdateJob),
    /// One document task.
    Task(TaskJob),
}

impl QueueJob {
    /// Access identifier of the owning token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        match self {
            Self::Update(job) => &job.access_token,
            Self::Task(job) => &job.access_token,
        }
    }

    /// Short job kind used in logs and summaries.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Task(_) => "task",
        }
    }
}

/// A job handed to a consumer by [`crate::core::DurableQueue::reserve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedJob {
    /// Queue-assigned identifier.
    pub id: JobId,
    /// Queue the job was reserved from.
    pub queue: String,
    /// Job payload.
    pub job: QueueJob,
    /// Policy the job was pushed with.
    pub policy: RetryPolicy,
    /// Attempt number for this reservation (1-based).
    pub attempt: u32,
}

impl ReservedJob {
    /// Compact description forwarded in outcome events.
    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            queue: self.queue.clone(),
            kind: self.job.kind().to_string(),
            task_type: match &self.job {
                QueueJob::Task(task) => Some(task.task_type.clone()),
                QueueJob::Update(_) => None,
            },
            access_token: self.job.access_token().to_string(),
            attempt: self.attempt,
        }
    }
}

/// Outcome category of one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// The job finished successfully.
    Completed,
    /// The job returned an error.
    Failed,
    /// The job exceeded its per-attempt timeout.
    Timeout,
}

/// Compact job description carried by outcome events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Queue-assigned identifier.
    pub id: JobId,
    /// Queue name.
    pub queue: String,
    /// `update` or `task`.
    pub kind: String,
    /// Task type for task jobs.
    #[serde(default)]
    pub task_type: Option<String>,
    /// Access identifier of the owning token.
    pub access_token: String,
    /// Attempt number (1-based).
    pub attempt: u32,
}

/// Serializable error attached to a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// The failure was classified as credential-related.
    pub credential: bool,
    /// Display form of the error.
    pub message: String,
}

impl From<&TaskError> for JobError {
    fn from(err: &TaskError) -> Self {
        Self {
            credential: err.is_credential(),
            message: err.to_string(),
        }
    }
}

/// Per-attempt outcome forwarded from a worker to the pool listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Outcome category.
    pub event: JobEventKind,
    /// Job the outcome belongs to.
    pub job: JobSummary,
    /// Failure details for `failed` and `timeout`.
    #[serde(default)]
    pub error: Option<JobError>,
    /// The queue scheduled another attempt.
    #[serde(default)]
    pub will_retry: bool,
}

impl JobOutcome {
    /// Whether this outcome must flip the token into `RequireRefresh`.
    #[must_use]
    pub fn is_credential_failure(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            attempts: 4,
            delay_ms: 250,
            exponential: false,
            timeout_ms: 1000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 5,
            delay_ms: 100,
            exponential: true,
            timeout_ms: 1000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn queue_job_is_tagged_on_the_wire() {
        let job = QueueJob::Task(TaskJob {
            access_token: "tok".into(),
            task_type: "additions".into(),
            payload: serde_json::json!({"identifier": "a"}),
        });
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["task_type"], "additions");
        assert_eq!(job.kind(), "task");
        assert_eq!(job.access_token(), "tok");
    }
}
