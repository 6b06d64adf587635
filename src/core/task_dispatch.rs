//! Execution of reserved account-queue jobs inside a worker process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::core::update_cycle::{run_update_cycle, TaskSink};
use crate::core::{
    Downstream, DurableQueue, Integration, ProviderError, QueueJob, ReservedJob, RetryPolicy,
    ScratchCache, TaskContext, TaskError, TaskJob, Token, TokenCache, TokenStore, UpdateJob,
};

/// Collaborators shared by every job of one worker process.
#[derive(Clone)]
pub struct ProcessorDeps {
    /// Token records.
    pub store: Arc<dyn TokenStore>,
    /// Account queues.
    pub queue: Arc<dyn DurableQueue>,
    /// Integrator code.
    pub integration: Integration,
    /// Token snapshots for task jobs.
    pub token_cache: TokenCache,
    /// Scratch cache handed to task workers.
    pub scratch: ScratchCache,
}

/// Runs Update and Task jobs for one account.
pub struct AccountProcessor {
    deps: ProcessorDeps,
    api_url: String,
    task_policy: RetryPolicy,
    limits: HashMap<String, Arc<Semaphore>>,
}

impl AccountProcessor {
    /// Build a processor; every task type gets its own concurrency limit.
    #[must_use]
    pub fn new(deps: ProcessorDeps, api_url: impl Into<String>, task_policy: RetryPolicy) -> Self {
        let limits = deps
            .integration
            .task_types()
            .filter_map(|name| {
                let worker = deps.integration.worker(name).ok()?;
                Some((name.to_string(), Arc::new(Semaphore::new(worker.concurrency().max(1)))))
            })
            .collect();
        Self {
            deps,
            api_url: api_url.into(),
            task_policy,
            limits,
        }
    }

    /// Execute one reserved job.
    ///
    /// A job whose token was revoked in the meantime is acknowledged without
    /// running.
    ///
    /// # Errors
    ///
    /// The job's failure, classified for the retry decision.
    pub async fn execute(&self, reserved: &ReservedJob) -> Result<(), TaskError> {
        let token = self.lookup(&reserved.job).await?;
        let Some(token) = token else {
            info!(job_id = %reserved.id, "token no longer exists, acknowledging job");
            return Ok(());
        };

        info!(
            job_id = %reserved.id,
            kind = reserved.job.kind(),
            account = %token.account_name,
            attempt = reserved.attempt,
            "executing job"
        );

        match &reserved.job {
            QueueJob::Update(job) => self.run_update(reserved, &token, job).await,
            QueueJob::Task(job) => self.run_task(reserved, token, job).await,
        }
    }

    /// Update jobs always read the store; task jobs go through the cache and
    /// populate it once per burst.
    async fn lookup(&self, job: &QueueJob) -> Result<Option<Token>, ProviderError> {
        let access_token = job.access_token();
        if let QueueJob::Task(_) = job {
            if let Some(token) = self.deps.token_cache.get(access_token) {
                return Ok(Some(token));
            }
        }
        let token = self.deps.store.find_by_access_token(access_token).await?;
        if let (QueueJob::Task(_), Some(token)) = (job, &token) {
            self.deps.token_cache.put_token(token);
        }
        Ok(token)
    }

    async fn run_update(&self, reserved: &ReservedJob, token: &Token, job: &UpdateJob) -> Result<(), TaskError> {
        let sink = TaskSink {
            queue: Arc::clone(&self.deps.queue),
            queue_name: reserved.queue.clone(),
            access_token: token.access_token.clone(),
            policy: self.task_policy,
        };
        let report = run_update_cycle(
            self.deps.store.as_ref(),
            &self.deps.integration,
            &sink,
            token,
            job,
        )
        .await?;
        info!(
            account = %token.account_name,
            finalization = ?report.finalization,
            "update cycle finished"
        );
        report.error.map_or(Ok(()), Err)
    }

    async fn run_task(&self, reserved: &ReservedJob, token: Token, job: &TaskJob) -> Result<(), TaskError> {
        let worker = self.deps.integration.worker(&job.task_type)?;
        let _permit = match self.limits.get(&job.task_type) {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(TaskError::transient)?,
            ),
            None => None,
        };
        let ctx = TaskContext {
            task: job.payload.clone(),
            service_data: token.data,
            account_name: token.account_name,
            cache: self.deps.scratch.clone(),
            downstream: Downstream {
                access_token: token.access_token,
                api_url: self.api_url.clone(),
            },
            attempt: reserved.attempt,
        };
        let result = worker.process(ctx).await;
        if let Err(err) = &result {
            warn!(job_id = %reserved.id, task_type = %job.task_type, error = %err, "task failed");
        }
        result
    }
}
