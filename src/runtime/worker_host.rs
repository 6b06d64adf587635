//! Worker-process side of the protocol.
//!
//! A host waits for its startup payload, then consumes the account queue
//! with bounded concurrency until the supervisor asks it to exit. State
//! reports are sent whenever the busy/idle view changes; the supervisor
//! drains the pool once every worker reports idle.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::{
    AccountProcessor, DurableQueue, JobError, JobEventKind, JobOutcome, ParentMessage, ProcessorDeps, ProviderError,
    ReservedJob, TaskError, WorkerMessage, WorkerStartup,
};
use crate::runtime::wire::{self, Wire};
use crate::util::init_worker_tracing;

type Outbox = mpsc::UnboundedSender<WorkerMessage>;

enum Attempt {
    Finished(Result<(), TaskError>),
    TimedOut,
    Panicked(String),
}

/// Runs account jobs inside a worker process.
pub struct WorkerHost {
    deps: ProcessorDeps,
}

impl WorkerHost {
    /// Host around the worker's collaborators.
    #[must_use]
    pub const fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }

    /// Serve the protocol on stdin/stdout. Integrator binaries call this from
    /// `main`.
    pub async fn serve_stdio(&self) -> ExitCode {
        init_worker_tracing();
        match self.serve(tokio::io::stdin(), tokio::io::stdout()).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error = %err, "worker failed");
                ExitCode::FAILURE
            }
        }
    }

    /// Serve the protocol on an arbitrary stream pair.
    ///
    /// Returns once the supervisor asked to exit (or closed the stream) and
    /// every in-flight job has finished.
    ///
    /// # Errors
    ///
    /// A malformed startup payload, a queue failure or a panicking job. A
    /// `fault` message has been sent by then.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), ProviderError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Wire {
            outgoing,
            mut incoming,
            reader: _,
            writer: flushed,
        }: Wire<WorkerMessage, ParentMessage> = wire::connect(reader, writer);

        let startup = loop {
            match incoming.recv().await {
                Some(ParentMessage::Start { payload }) => {
                    break serde_json::from_value::<WorkerStartup>(payload)
                        .map_err(|e| ProviderError::Protocol(format!("bad startup payload: {e}")));
                }
                Some(ParentMessage::Exit) | None => {
                    debug!("exit before startup");
                    drop(outgoing);
                    let _ = flushed.await;
                    return Ok(());
                }
            }
        };

        let (shutdown_tx, shutdown) = watch::channel(false);
        let control = tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                match message {
                    ParentMessage::Exit => break,
                    ParentMessage::Start { .. } => warn!("duplicate startup payload ignored"),
                }
            }
            let _ = shutdown_tx.send(true);
        });

        let result = match startup {
            Ok(startup) => {
                info!(
                    account = %startup.account_name,
                    queue = %startup.queue_name,
                    concurrency = startup.concurrency,
                    "worker started"
                );
                self.consume(&startup, &outgoing, shutdown).await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            let _ = outgoing.send(WorkerMessage::Fault {
                error: err.to_string(),
            });
        }

        control.abort();
        drop(outgoing);
        let _ = flushed.await;
        result
    }

    async fn consume(
        &self,
        startup: &WorkerStartup,
        outbox: &Outbox,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProviderError> {
        let processor = Arc::new(AccountProcessor::new(
            self.deps.clone(),
            startup.api_url.clone(),
            startup.task_policy,
        ));
        let queue = &self.deps.queue;
        let queue_name = startup.queue_name.as_str();
        let concurrency = startup.concurrency.max(1);
        let idle = Duration::from_millis(startup.idle_poll_ms.max(1));
        let mut running: JoinSet<Result<(), ProviderError>> = JoinSet::new();
        let mut reported: Option<bool> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            while running.len() < concurrency {
                let Some(job) = queue.reserve(queue_name).await? else {
                    break;
                };
                running.spawn(run_job(
                    Arc::clone(&processor),
                    Arc::clone(queue),
                    job,
                    outbox.clone(),
                ));
            }

            let processing = !running.is_empty() || !queue.depth(queue_name).await?.is_drained();
            if reported != Some(processing) {
                reported = Some(processing);
                let _ = outbox.send(WorkerMessage::State { processing });
            }

            tokio::select! {
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    settle(joined)?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(idle) => {}
            }
        }

        debug!(in_flight = running.len(), "exit requested, finishing in-flight jobs");
        while let Some(joined) = running.join_next().await {
            settle(joined)?;
        }
        Ok(())
    }
}

fn settle(joined: Result<Result<(), ProviderError>, tokio::task::JoinError>) -> Result<(), ProviderError> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(ProviderError::Fault(err.to_string())),
    }
}

async fn run_job(
    processor: Arc<AccountProcessor>,
    queue: Arc<dyn DurableQueue>,
    job: ReservedJob,
    outbox: Outbox,
) -> Result<(), ProviderError> {
    let summary = job.summary();
    let timeout = job.policy.timeout();

    // Owned by a JoinSet so the attempt dies with this task.
    let mut running = JoinSet::new();
    {
        let processor = Arc::clone(&processor);
        let job = job.clone();
        running.spawn(async move { processor.execute(&job).await });
    }
    let waited = tokio::time::timeout(timeout, running.join_next()).await;
    let attempt = match waited {
        Ok(Some(Ok(result))) => Attempt::Finished(result),
        Ok(Some(Err(join))) => Attempt::Panicked(join.to_string()),
        Ok(None) => Attempt::Panicked("attempt vanished".into()),
        Err(_) => {
            running.abort_all();
            Attempt::TimedOut
        }
    };

    let (event, error) = match attempt {
        Attempt::Finished(Ok(())) => {
            queue.complete(&job.queue, job.id).await?;
            (JobEventKind::Completed, None)
        }
        Attempt::Finished(Err(err)) => (JobEventKind::Failed, Some(err)),
        Attempt::TimedOut => (
            JobEventKind::Timeout,
            Some(TaskError::Transient(format!("timed out after {timeout:?}"))),
        ),
        Attempt::Panicked(message) => {
            queue.fail(&job.queue, job.id, true).await?;
            return Err(ProviderError::Fault(format!("job {} panicked: {message}", job.id)));
        }
    };

    let will_retry = match &error {
        Some(err) => queue.fail(&job.queue, job.id, !err.is_credential()).await?.will_retry(),
        None => false,
    };
    if let Some(err) = &error {
        warn!(job_id = %job.id, kind = %summary.kind, event = ?event, will_retry, error = %err, "job attempt failed");
    }
    let _ = outbox.send(WorkerMessage::Job(JobOutcome {
        event,
        job: summary,
        error: error.as_ref().map(JobError::from),
        will_retry,
    }));
    Ok(())
}
