//! Worker processes as OS child processes speaking JSON lines on stdio.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::WorkerCommand;
use crate::core::{ParentMessage, ProviderError, WorkerConnection, WorkerExit, WorkerId, WorkerLauncher, WorkerMessage};
use crate::runtime::wire::{self, Wire};

/// Environment variable carrying the worker id into the child.
pub const WORKER_ID_ENV: &str = "PROVIDER_WORKER_ID";

/// How long the exit report waits for the child's remaining output.
const OUTPUT_FLUSH: Duration = Duration::from_secs(1);

/// Launches workers with `tokio::process`.
///
/// The child's stdin and stdout carry the protocol; stderr is inherited so
/// its logs end up next to the supervisor's.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    /// Launcher for `command`.
    #[must_use]
    pub const fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, id: WorkerId) -> Result<WorkerConnection, ProviderError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(&self.command.env)
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Spawn(format!("{}: {e}", self.command.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Spawn("child stdout unavailable".into()))?;
        info!(worker = id, pid = ?child.id(), "worker process spawned");

        let Wire {
            outgoing,
            incoming,
            reader,
            writer: _,
        }: Wire<ParentMessage, WorkerMessage> = wire::connect(stdout, stdin);
        let (exit_tx, exit) = oneshot::channel();
        let (kill, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let (status, killed) = match waited {
                Some(status) => (status, false),
                None => {
                    let _ = child.start_kill();
                    (child.wait().await, true)
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    debug!(worker = id, error = %err, "failed to reap worker");
                    None
                }
            };
            finish(id, reader, exit_tx, WorkerExit { code, killed }).await;
        });

        Ok(WorkerConnection {
            commands: outgoing,
            messages: incoming,
            exit,
            kill,
        })
    }
}

/// Report the exit once the worker's output has been relayed.
pub(crate) async fn finish(
    id: WorkerId,
    reader: JoinHandle<()>,
    exit_tx: oneshot::Sender<WorkerExit>,
    exit: WorkerExit,
) {
    if tokio::time::timeout(OUTPUT_FLUSH, reader).await.is_err() {
        debug!(worker = id, "worker output still open after exit");
    }
    debug!(worker = id, code = ?exit.code, killed = exit.killed, "worker gone");
    let _ = exit_tx.send(exit);
}
