//! Workers hosted as tokio tasks, speaking the same protocol over in-memory
//! pipes. Useful when embedding the provider and in tests.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info};

use crate::core::{ParentMessage, ProviderError, WorkerConnection, WorkerExit, WorkerId, WorkerLauncher, WorkerMessage};
use crate::runtime::process::finish;
use crate::runtime::wire::{self, Wire};
use crate::runtime::WorkerHost;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Launches [`WorkerHost`]s on the current runtime.
///
/// A host returning an error exits with code 1; a panicking host exits with
/// code 101. Killing aborts the task.
#[derive(Clone)]
pub struct InProcessLauncher {
    host: Arc<WorkerHost>,
}

impl InProcessLauncher {
    /// Launcher running `host` for every worker.
    #[must_use]
    pub const fn new(host: Arc<WorkerHost>) -> Self {
        Self { host }
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, id: WorkerId) -> Result<WorkerConnection, ProviderError> {
        let (parent_io, worker_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (parent_read, parent_write) = tokio::io::split(parent_io);
        let (worker_read, worker_write) = tokio::io::split(worker_io);

        let Wire {
            outgoing,
            incoming,
            reader,
            writer: _,
        }: Wire<ParentMessage, WorkerMessage> = wire::connect(parent_read, parent_write);

        let host = Arc::clone(&self.host);
        let mut body = tokio::spawn(async move { host.serve(worker_read, worker_write).await });
        info!(worker = id, "in-process worker started");

        let (exit_tx, exit) = oneshot::channel();
        let (kill, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let joined = tokio::select! {
                joined = &mut body => Some(joined),
                _ = kill_rx => None,
            };
            let status = match joined {
                Some(Ok(Ok(()))) => WorkerExit { code: Some(0), killed: false },
                Some(Ok(Err(err))) => {
                    error!(worker = id, error = %err, "in-process worker failed");
                    WorkerExit { code: Some(1), killed: false }
                }
                Some(Err(err)) => {
                    error!(worker = id, error = %err, "in-process worker panicked");
                    WorkerExit { code: Some(101), killed: false }
                }
                None => {
                    body.abort();
                    let _ = body.await;
                    WorkerExit { code: None, killed: true }
                }
            };
            finish(id, reader, exit_tx, status).await;
        });

        Ok(WorkerConnection {
            commands: outgoing,
            messages: incoming,
            exit,
            kill,
        })
    }
}
