//! Update cycle: turn one delta retrieval into task jobs, then finalize the token.
//!
//! Pushes are accepted synchronously and written to the durable queue by one
//! writer per sub-queue, so jobs land in push order. Finalization waits on a
//! drain barrier: the generator has returned and the in-flight write counter
//! is back to zero.
//!
//! Enqueueing and the cursor write are not transactional. A crash between
//! the two regenerates the same delta on the next cycle, so task processing
//! must be idempotent.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::core::{
    DurableQueue, Integration, ProviderError, QueueJob, RetryPolicy, TaskError, TaskJob, Token,
    TokenStore, UpdateJob,
};

/// Which pushed items become task jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueuePolicy {
    /// The first `n` items of every sub-queue, in push order.
    Capped(usize),
    /// Only items whose identifier matches, without a cap.
    SingleDocument(String),
}

impl EnqueuePolicy {
    /// Policy requested by an update job. A missing cap means no cap.
    #[must_use]
    pub fn for_job(job: &UpdateJob) -> Self {
        job.identifier.as_ref().map_or_else(
            || Self::Capped(job.documents_per_update.unwrap_or(usize::MAX)),
            |id| Self::SingleDocument(id.clone()),
        )
    }
}

/// Identifier of a generator item: its `identifier` field, string or number.
#[must_use]
pub fn document_identifier(item: &Value) -> Option<String> {
    match item.get("identifier")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Durable writes issued by pushes that have not landed yet.
#[derive(Default)]
struct InFlightWrites {
    pending: AtomicUsize,
    failed: AtomicUsize,
    notify: Notify,
}

impl InFlightWrites {
    fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self, ok: bool) {
        if !ok {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct SubQueueState {
    pushed: AtomicUsize,
    accepted: Mutex<usize>,
    writer: mpsc::UnboundedSender<Value>,
}

struct SubQueuesInner {
    policy: EnqueuePolicy,
    queues: HashMap<String, SubQueueState>,
    writes: Arc<InFlightWrites>,
}

/// Named sub-queues handed to the delta generator, one per task type.
///
/// Cloning yields another handle; clones may be moved into spawned tasks.
#[derive(Clone)]
pub struct SubQueues {
    inner: Arc<SubQueuesInner>,
}

/// Handle to a single sub-queue.
#[derive(Clone)]
pub struct SubQueue {
    queues: SubQueues,
    name: String,
}

/// Where the update cycle writes its task jobs.
pub struct TaskSink {
    /// Durable queue backend.
    pub queue: Arc<dyn DurableQueue>,
    /// Account queue name.
    pub queue_name: String,
    /// Access identifier stamped on every task.
    pub access_token: String,
    /// Policy attached to every task.
    pub policy: RetryPolicy,
}

impl SubQueues {
    /// Open one sub-queue per task type, each with its own ordered writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<'a>(
        task_types: impl IntoIterator<Item = &'a str>,
        policy: EnqueuePolicy,
        sink: &TaskSink,
    ) -> Self {
        let writes = Arc::new(InFlightWrites::default());
        let mut queues = HashMap::new();
        for task_type in task_types {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_tasks(
                rx,
                Arc::clone(&sink.queue),
                sink.queue_name.clone(),
                sink.access_token.clone(),
                task_type.to_string(),
                sink.policy,
                Arc::clone(&writes),
            ));
            queues.insert(
                task_type.to_string(),
                SubQueueState {
                    pushed: AtomicUsize::new(0),
                    accepted: Mutex::new(0),
                    writer: tx,
                },
            );
        }
        Self {
            inner: Arc::new(SubQueuesInner {
                policy,
                queues,
                writes,
            }),
        }
    }

    /// Push an item onto the named sub-queue.
    ///
    /// Returns whether the item was accepted for enqueueing; items past the
    /// cap or not matching the requested identifier are dropped.
    ///
    /// # Errors
    ///
    /// - `UnknownTaskType` for a name with no registered worker
    /// - `Queue` if the cycle is already finalized
    pub fn push(&self, task_type: &str, item: Value) -> Result<bool, ProviderError> {
        let state = self
            .inner
            .queues
            .get(task_type)
            .ok_or_else(|| ProviderError::UnknownTaskType(task_type.to_string()))?;
        state.pushed.fetch_add(1, Ordering::AcqRel);

        let accepted = match &self.inner.policy {
            EnqueuePolicy::Capped(cap) => {
                let mut accepted = state.accepted.lock();
                if *accepted < *cap {
                    *accepted += 1;
                    true
                } else {
                    false
                }
            }
            EnqueuePolicy::SingleDocument(id) => {
                if document_identifier(&item).as_deref() == Some(id.as_str()) {
                    *state.accepted.lock() += 1;
                    info!(task_type, identifier = %id, "reproviding document");
                    true
                } else {
                    false
                }
            }
        };
        if !accepted {
            return Ok(false);
        }

        self.inner.writes.begin();
        if state.writer.send(item).is_err() {
            self.inner.writes.end(false);
            return Err(ProviderError::Queue(format!("sub-queue {task_type} is closed")));
        }
        Ok(true)
    }

    /// Handle for one sub-queue, if registered.
    #[must_use]
    pub fn queue(&self, task_type: &str) -> Option<SubQueue> {
        self.inner.queues.contains_key(task_type).then(|| SubQueue {
            queues: self.clone(),
            name: task_type.to_string(),
        })
    }

    /// Registered sub-queue names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Items pushed and accepted so far, per sub-queue.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<String, SubQueueCount> {
        self.inner
            .queues
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    SubQueueCount {
                        pushed: state.pushed.load(Ordering::Acquire),
                        enqueued: *state.accepted.lock(),
                    },
                )
            })
            .collect()
    }

    async fn drained(&self) -> usize {
        self.inner.writes.drained().await;
        self.inner.writes.failed.load(Ordering::Acquire)
    }
}

impl SubQueue {
    /// Push an item; see [`SubQueues::push`].
    ///
    /// # Errors
    ///
    /// `Queue` if the cycle is already finalized.
    pub fn push(&self, item: Value) -> Result<bool, ProviderError> {
        self.queues.push(&self.name, item)
    }

    /// Sub-queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Push and enqueue totals for one sub-queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubQueueCount {
    /// Items the generator pushed.
    pub pushed: usize,
    /// Items accepted for enqueueing.
    pub enqueued: usize,
}

async fn write_tasks(
    mut rx: mpsc::UnboundedReceiver<Value>,
    queue: Arc<dyn DurableQueue>,
    queue_name: String,
    access_token: String,
    task_type: String,
    policy: RetryPolicy,
    writes: Arc<InFlightWrites>,
) {
    while let Some(payload) = rx.recv().await {
        let job = QueueJob::Task(TaskJob {
            access_token: access_token.clone(),
            task_type: task_type.clone(),
            payload,
        });
        match queue.push(&queue_name, job, policy).await {
            Ok(id) => {
                debug!(queue = %queue_name, task_type = %task_type, job_id = %id, "task enqueued");
                writes.end(true);
            }
            Err(e) => {
                error!(queue = %queue_name, task_type = %task_type, error = %e, "failed to enqueue task");
                writes.end(false);
            }
        }
    }
}

/// How the cycle left the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// Cursor and data persisted, lock released.
    Unlocked,
    /// Credential failure recorded; lock kept.
    RequireRefresh,
    /// Cycle failed; the lock stays until stale-lock detection retries.
    LeftLocked,
    /// Single-document reprovision; token untouched.
    Untouched,
    /// Token was revoked while the cycle ran.
    TokenGone,
}

/// Summary of one update cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Totals per sub-queue.
    pub counts: BTreeMap<String, SubQueueCount>,
    /// Token finalization.
    pub finalization: Finalization,
    /// Failure that must be reported on the update job.
    pub error: Option<TaskError>,
}

/// Run one update cycle for `token`.
///
/// # Errors
///
/// Store failures while finalizing; generator failures are reported in the
/// returned [`CycleReport`].
pub async fn run_update_cycle(
    store: &dyn TokenStore,
    integration: &Integration,
    sink: &TaskSink,
    token: &Token,
    job: &UpdateJob,
) -> Result<CycleReport, ProviderError> {
    let policy = EnqueuePolicy::for_job(job);
    let queues = SubQueues::open(integration.task_types(), policy, sink);
    let cursor = if job.is_single_document() {
        None
    } else {
        token.cursor.clone()
    };

    let retrieved = integration
        .generator()
        .retrieve(token.data.clone(), cursor, queues.clone())
        .await;
    let failed_writes = queues.drained().await;
    let counts = queues.counts();
    drop(queues);

    for (name, count) in &counts {
        info!(
            account = %token.account_name,
            task_type = %name,
            pushed = count.pushed,
            enqueued = count.enqueued,
            "new tasks"
        );
    }

    if job.is_single_document() {
        if counts.values().all(|c| c.enqueued == 0) {
            warn!(account = %token.account_name, identifier = ?job.identifier, "document not found");
        }
        return Ok(CycleReport {
            counts,
            finalization: Finalization::Untouched,
            error: retrieved.err(),
        });
    }

    let retrieved = match retrieved {
        Ok(_) if failed_writes > 0 => Err(TaskError::Transient(format!(
            "{failed_writes} task(s) could not be enqueued"
        ))),
        other => other,
    };

    let (finalization, error) = match retrieved {
        Ok(delta) => {
            let finalization = finalize(store, &token.access_token, |current| {
                current.complete_update(delta.cursor, delta.service_data);
                Finalization::Unlocked
            })
            .await?;
            (finalization, None)
        }
        Err(err) if err.is_credential() => {
            warn!(account = %token.account_name, error = %err, "credential failure during update");
            let finalization = finalize(store, &token.access_token, |current| {
                current.mark_require_refresh();
                Finalization::RequireRefresh
            })
            .await?;
            (finalization, Some(err))
        }
        Err(err) => {
            warn!(account = %token.account_name, error = %err, "update cycle failed, lock kept for stale retry");
            (Finalization::LeftLocked, Some(err))
        }
    };

    Ok(CycleReport {
        counts,
        finalization,
        error,
    })
}

/// Re-read the token and apply `mutate` to the current record.
async fn finalize(
    store: &dyn TokenStore,
    access_token: &str,
    mutate: impl FnOnce(&mut Token) -> Finalization,
) -> Result<Finalization, ProviderError> {
    let Some(mut current) = store.find_by_access_token(access_token).await? else {
        info!("token revoked during update, skipping finalization");
        return Ok(Finalization::TokenGone);
    };
    let finalization = mutate(&mut current);
    store.save(&current).await?;
    Ok(finalization)
}
