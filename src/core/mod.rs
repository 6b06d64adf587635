//! Orchestration core: tokens, jobs, queues, update cycles and worker pools.

pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod job;
pub mod protocol;
pub mod queue;
pub mod supervisor;
pub mod task_dispatch;
pub mod token;
pub mod update_cycle;

pub use cache::{LruTtlCache, ScratchCache, TokenCache};
pub use dispatcher::{
    AccountQueueDispatcher, DispatchOutcome, DispatchStatus, Finalize, PoolSettings, Spawn,
};
pub use error::{AppResult, ProviderError, TaskError};
pub use executor::{Delta, DeltaGenerator, Downstream, Integration, TaskContext, TaskWorker};
pub use job::{
    JobError, JobEventKind, JobId, JobOutcome, JobSummary, QueueJob, ReservedJob, RetryPolicy, TaskJob,
    UpdateJob,
};
pub use protocol::{decode_line, encode_line, ParentMessage, WorkerMessage, WorkerStartup};
pub use queue::{DurableQueue, FailureDisposition, QueueDepth, TokenStore};
pub use supervisor::{
    PoolEvent, PoolStop, ProcessSupervisor, RestartPolicy, SupervisorOptions, WorkerConnection,
    WorkerExit, WorkerId, WorkerLauncher, WorkerState,
};
pub use task_dispatch::{AccountProcessor, ProcessorDeps};
pub use token::{TempToken, Token, TokenState, UpdateAdmission, DEFAULT_STALE_THRESHOLD};
pub use update_cycle::{
    document_identifier, run_update_cycle, CycleReport, EnqueuePolicy, Finalization, SubQueue,
    SubQueueCount, SubQueues, TaskSink,
};
