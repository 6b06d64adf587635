//! Integrator-supplied code: delta retrieval and per-task workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ProviderError, ScratchCache, SubQueues, TaskError};

/// Result of one delta retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Cursor to resume from on the next cycle.
    pub cursor: Option<Value>,
    /// Replacement service data; `None` keeps the stored data.
    pub service_data: Option<Value>,
}

/// Pluggable delta retrieval.
///
/// The generator pushes items onto any of the provided sub-queues, from the
/// calling task or from tasks it spawns, and returns once every push has been
/// issued. Returning is the completion signal; it happens exactly once.
///
/// # Example
///
/// ```rust,ignore
/// struct Dropbox;
///
/// #[async_trait]
/// impl DeltaGenerator for Dropbox {
///     async fn retrieve(&self, data: Value, cursor: Option<Value>, queues: SubQueues) -> Result<Delta, TaskError> {
///         let delta = fetch_delta(&data, cursor).await.map_err(TaskError::transient)?;
///         for file in delta.created {
///             queues.push("additions", file)?;
///         }
///         Ok(Delta { cursor: Some(delta.cursor), service_data: None })
///     }
/// }
/// ```
#[async_trait]
pub trait DeltaGenerator: Send + Sync + 'static {
    /// Retrieve the delta since `cursor`. A `None` cursor means a full listing.
    async fn retrieve(
        &self,
        service_data: Value,
        cursor: Option<Value>,
        queues: SubQueues,
    ) -> Result<Delta, TaskError>;
}

/// Credentials for the downstream API the task delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downstream {
    /// Downstream access token (the token's access identifier).
    pub access_token: String,
    /// Downstream API base URL.
    pub api_url: String,
}

/// Everything a task worker sees for one job.
#[derive(Clone)]
pub struct TaskContext {
    /// Item pushed by the generator.
    pub task: Value,
    /// Service data of the owning token.
    pub service_data: Value,
    /// Account name of the owning token.
    pub account_name: String,
    /// Scratch cache shared by every task of the worker process.
    pub cache: ScratchCache,
    /// Downstream client credentials.
    pub downstream: Downstream,
    /// Attempt number (1-based).
    pub attempt: u32,
}

/// Pluggable processing for one task type.
#[async_trait]
pub trait TaskWorker: Send + Sync + 'static {
    /// Deliver or delete one document.
    async fn process(&self, ctx: TaskContext) -> Result<(), TaskError>;

    /// Maximum concurrent jobs of this type inside one worker process.
    fn concurrency(&self) -> usize {
        1
    }
}

/// The integrator's generator plus its named task workers.
#[derive(Clone)]
pub struct Integration {
    generator: Arc<dyn DeltaGenerator>,
    workers: BTreeMap<String, Arc<dyn TaskWorker>>,
}

impl Integration {
    /// Start a registry around a generator.
    pub fn new(generator: impl DeltaGenerator) -> Self {
        Self {
            generator: Arc::new(generator),
            workers: BTreeMap::new(),
        }
    }

    /// Register a worker for a task type (a sub-queue name).
    #[must_use]
    pub fn with_worker(mut self, task_type: impl Into<String>, worker: impl TaskWorker) -> Self {
        self.workers.insert(task_type.into(), Arc::new(worker));
        self
    }

    /// The delta generator.
    #[must_use]
    pub fn generator(&self) -> &Arc<dyn DeltaGenerator> {
        &self.generator
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    /// Worker registered for `task_type`.
    ///
    /// # Errors
    ///
    /// `UnknownTaskType` when nothing is registered under that name.
    pub fn worker(&self, task_type: &str) -> Result<&Arc<dyn TaskWorker>, ProviderError> {
        self.workers
            .get(task_type)
            .ok_or_else(|| ProviderError::UnknownTaskType(task_type.to_string()))
    }
}
