//! Runtime adapters: worker launchers, the worker host and the handler surface.

pub mod api;
pub mod in_process;
pub mod process;
pub mod tokio_spawner;
pub mod wire;
pub mod worker_host;

pub use api::{ProviderService, QueueStatus, TokenStatus, UpdateAccepted, UpdateRequest, DEFAULT_RETURN_TO};
pub use in_process::InProcessLauncher;
pub use process::{ProcessLauncher, WORKER_ID_ENV};
pub use tokio_spawner::TokioSpawner;
pub use worker_host::WorkerHost;
