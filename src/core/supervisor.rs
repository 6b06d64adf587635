//! Supervision of a fixed-size pool of isolated worker processes.
//!
//! Every worker gets its own supervision task. The task launches the worker,
//! sends it the startup payload, relays its reports and respawns it with the
//! same payload whenever it dies on its own. Once every worker reports idle
//! the pool drains: each worker is asked to exit, and the pool emits a single
//! non-forced stop. [`ProcessSupervisor::kill`] terminates everything and
//! emits a forced stop instead.
//!
//! # Design Principles
//!
//! - **No polling**: control changes travel on a `watch` channel, the pool stop
//!   on another, job reports on a `broadcast` channel
//! - **Bounded termination**: a worker that ignores the exit request is killed
//!   after the grace period
//! - **Exactly one stop**: the first writer of the stop slot wins

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::core::{JobOutcome, ParentMessage, ProviderError, WorkerMessage};

/// Process-wide worker identifier. Kept across respawns.
pub type WorkerId = u64;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

const EVENT_CAPACITY: usize = 1024;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, absent when the process was ended by a signal.
    pub code: Option<i32>,
    /// The supervisor hard-killed the process.
    pub killed: bool,
}

impl WorkerExit {
    /// Exit code zero without a hard kill.
    #[must_use]
    pub const fn success(self) -> bool {
        !self.killed && matches!(self.code, Some(0))
    }
}

/// Supervisor end of one launched worker.
pub struct WorkerConnection {
    /// Messages to the worker, written in order.
    pub commands: mpsc::UnboundedSender<ParentMessage>,
    /// Parsed messages from the worker. Unparseable output never shows up here.
    pub messages: mpsc::UnboundedReceiver<WorkerMessage>,
    /// Resolves once the worker is gone and its output has been drained.
    pub exit: oneshot::Receiver<WorkerExit>,
    /// Hard kill. Dropping it unsent also kills a still-running worker.
    pub kill: oneshot::Sender<()>,
}

/// Starts worker processes.
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Launch one worker.
    ///
    /// # Errors
    ///
    /// `Spawn` when the worker cannot be started.
    fn launch(&self, id: WorkerId) -> Result<WorkerConnection, ProviderError>;
}

/// Lifecycle of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Being launched or relaunched.
    Starting,
    /// Alive; `processing` is the latest busy report.
    Running {
        /// The worker still sees pending work.
        processing: bool,
    },
    /// Asked to exit.
    Stopping,
    /// Gone for good.
    Stopped {
        /// Terminated before it could report a clean exit.
        forced: bool,
    },
}

impl WorkerState {
    const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped { .. })
    }

    const fn is_idle(self) -> bool {
        matches!(self, Self::Running { processing: false } | Self::Stopped { .. })
    }
}

/// Reports relayed from the workers.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// One job attempt finished.
    Job {
        /// Reporting worker.
        worker: WorkerId,
        /// What happened.
        outcome: JobOutcome,
    },
    /// A worker hit an uncaught error.
    Fault {
        /// Reporting worker.
        worker: WorkerId,
        /// Display form of the error.
        error: String,
    },
    /// A worker died on its own and is being relaunched.
    Restarted {
        /// Affected worker.
        worker: WorkerId,
        /// How it died.
        exit: WorkerExit,
    },
}

/// The single stop signal of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStop {
    /// `true` when the pool was killed rather than drained.
    pub forced: bool,
}

/// Respawn limits after unexpected exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Pause before relaunching a crashed worker.
    pub backoff: Duration,
    /// Consecutive crashes without a state report before the worker is
    /// abandoned. `None` retries forever.
    pub max_consecutive: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::ZERO,
            max_consecutive: None,
        }
    }
}

impl RestartPolicy {
    const fn allows(&self, crashes: u32) -> bool {
        match self.max_consecutive {
            Some(max) => crashes <= max,
            None => true,
        }
    }
}

/// Pool sizing and termination settings.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Worker processes in the pool.
    pub workers: usize,
    /// Time a worker gets to honor an exit request before the hard kill.
    pub kill_grace: Duration,
    /// Respawn limits.
    pub restart: RestartPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Drain,
    Kill,
}

enum ConnectionEnd {
    /// The worker exited while we were stopping it.
    Stopped { forced: bool },
    /// The worker exited on its own.
    Exited(WorkerExit),
}

struct Shared {
    label: String,
    launcher: Arc<dyn WorkerLauncher>,
    payload: Value,
    options: SupervisorOptions,
    states: Mutex<BTreeMap<WorkerId, WorkerState>>,
    restarts: AtomicU64,
    events: broadcast::Sender<PoolEvent>,
    mode: watch::Sender<Mode>,
    stopped: watch::Sender<Option<PoolStop>>,
}

impl Shared {
    fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    fn set_state(&self, id: WorkerId, state: WorkerState) {
        self.states.lock().insert(id, state);
    }

    fn publish(&self, event: PoolEvent) {
        // No subscriber is fine.
        let _ = self.events.send(event);
    }

    /// Returns `true` for a state report.
    fn handle_message(&self, id: WorkerId, message: WorkerMessage) -> bool {
        match message {
            WorkerMessage::State { processing } => {
                {
                    let mut states = self.states.lock();
                    if let Some(state) = states.get_mut(&id) {
                        if matches!(state, WorkerState::Starting | WorkerState::Running { .. }) {
                            *state = WorkerState::Running { processing };
                        }
                    }
                }
                debug!(pool = %self.label, worker = id, processing, "worker state");
                self.check_drain();
                true
            }
            WorkerMessage::Job(outcome) => {
                debug!(
                    pool = %self.label,
                    worker = id,
                    job_id = %outcome.job.id,
                    event = ?outcome.event,
                    will_retry = outcome.will_retry,
                    "job outcome"
                );
                self.publish(PoolEvent::Job { worker: id, outcome });
                false
            }
            WorkerMessage::Fault { error } => {
                error!(pool = %self.label, worker = id, %error, "worker fault");
                self.publish(PoolEvent::Fault { worker: id, error });
                false
            }
        }
    }

    fn check_drain(&self) {
        if self.mode() != Mode::Run {
            return;
        }
        let idle = {
            let states = self.states.lock();
            states.values().all(|s| s.is_idle()) && states.values().any(|s| !s.is_stopped())
        };
        if idle {
            let switched = self.mode.send_if_modified(|mode| {
                if *mode == Mode::Run {
                    *mode = Mode::Drain;
                    true
                } else {
                    false
                }
            });
            if switched {
                info!(pool = %self.label, "all workers idle, draining pool");
            }
        }
    }

    fn worker_finished(&self, id: WorkerId, forced: bool) {
        self.set_state(id, WorkerState::Stopped { forced });
        let all_stopped = self.states.lock().values().all(|s| s.is_stopped());
        if !all_stopped {
            // A worker that left cleanly may have been the last busy one.
            self.check_drain();
            return;
        }
        let stop = PoolStop {
            forced: self.mode() == Mode::Kill,
        };
        let emitted = self.stopped.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(stop);
                true
            } else {
                false
            }
        });
        if emitted {
            info!(pool = %self.label, forced = stop.forced, "pool stopped");
        }
    }
}

/// A fixed-size pool of supervised worker processes for one account.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    ids: Vec<WorkerId>,
    started: Mutex<bool>,
}

impl ProcessSupervisor {
    /// Prepare a pool without launching anything yet.
    ///
    /// Subscribe with [`Self::subscribe`] before [`Self::start`] to see every
    /// report.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        launcher: Arc<dyn WorkerLauncher>,
        payload: Value,
        options: SupervisorOptions,
    ) -> Self {
        let ids: Vec<WorkerId> = (0..options.workers.max(1))
            .map(|_| NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
            .collect();
        let states = ids.iter().map(|id| (*id, WorkerState::Starting)).collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (mode, _) = watch::channel(Mode::Run);
        let (stopped, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                launcher,
                payload,
                options,
                states: Mutex::new(states),
                restarts: AtomicU64::new(0),
                events,
                mode,
                stopped,
            }),
            ids,
            started: Mutex::new(false),
        }
    }

    /// Prepare and start in one step.
    #[must_use]
    pub fn spawn(
        label: impl Into<String>,
        launcher: Arc<dyn WorkerLauncher>,
        payload: Value,
        options: SupervisorOptions,
    ) -> Self {
        let supervisor = Self::new(label, launcher, payload, options);
        supervisor.start();
        supervisor
    }

    /// Launch every worker. Later calls do nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut started = self.started.lock();
        if *started {
            return;
        }
        *started = true;
        info!(pool = %self.shared.label, workers = self.ids.len(), "starting worker pool");
        for id in &self.ids {
            tokio::spawn(supervise(Arc::clone(&self.shared), *id));
        }
    }

    /// Receive job, fault and restart reports.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Ask every worker to finish its in-flight work and exit.
    pub fn drain(&self) {
        self.shared.mode.send_if_modified(|mode| {
            if *mode == Mode::Run {
                *mode = Mode::Drain;
                true
            } else {
                false
            }
        });
    }

    /// Terminate every worker and wait for the pool stop.
    ///
    /// Workers get the exit request first and a hard kill after the grace
    /// period. Returns the stop that was emitted, which is the earlier drain
    /// stop if the pool had already drained.
    pub async fn kill(&self) -> PoolStop {
        if !*self.started.lock() {
            self.shared.mode.send_replace(Mode::Kill);
            for id in &self.ids {
                self.shared.worker_finished(*id, true);
            }
        } else if self.shared.stopped.borrow().is_none() {
            warn!(pool = %self.shared.label, "killing worker pool");
            self.shared.mode.send_replace(Mode::Kill);
        }
        self.wait_stopped().await
    }

    /// Wait for the pool stop.
    pub async fn wait_stopped(&self) -> PoolStop {
        let mut rx = self.shared.stopped.subscribe();
        loop {
            if let Some(stop) = *rx.borrow_and_update() {
                return stop;
            }
            if rx.changed().await.is_err() {
                return PoolStop { forced: true };
            }
        }
    }

    /// The pool stop, if it already happened.
    #[must_use]
    pub fn stopped(&self) -> Option<PoolStop> {
        *self.shared.stopped.borrow()
    }

    /// Current state of every worker slot.
    #[must_use]
    pub fn workers(&self) -> Vec<(WorkerId, WorkerState)> {
        self.shared
            .states
            .lock()
            .iter()
            .map(|(id, state)| (*id, *state))
            .collect()
    }

    /// Relaunches after unexpected exits so far.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// Pool label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Don't wait here; the supervision tasks terminate the workers.
        if self.shared.stopped.borrow().is_none() {
            self.shared.mode.send_replace(Mode::Kill);
        }
    }
}

async fn supervise(shared: Arc<Shared>, id: WorkerId) {
    let mut control = shared.mode.subscribe();
    let mut crashes: u32 = 0;

    let forced = loop {
        let mode = *control.borrow_and_update();
        if mode != Mode::Run {
            break mode == Mode::Kill;
        }

        shared.set_state(id, WorkerState::Starting);
        let exit = match shared.launcher.launch(id) {
            Ok(conn) => {
                debug!(pool = %shared.label, worker = id, "worker launched");
                if conn
                    .commands
                    .send(ParentMessage::Start {
                        payload: shared.payload.clone(),
                    })
                    .is_err()
                {
                    warn!(pool = %shared.label, worker = id, "worker closed its input before startup");
                }
                shared.set_state(id, WorkerState::Running { processing: true });
                match run_connection(&shared, id, conn, &mut control, &mut crashes).await {
                    ConnectionEnd::Stopped { forced } => break forced,
                    ConnectionEnd::Exited(exit) if exit.success() => {
                        info!(pool = %shared.label, worker = id, "worker exited");
                        break false;
                    }
                    ConnectionEnd::Exited(exit) => exit,
                }
            }
            Err(err) => {
                error!(pool = %shared.label, worker = id, error = %err, "failed to launch worker");
                WorkerExit {
                    code: None,
                    killed: false,
                }
            }
        };

        crashes += 1;
        shared.restarts.fetch_add(1, Ordering::Relaxed);
        if !shared.options.restart.allows(crashes) {
            error!(
                pool = %shared.label,
                worker = id,
                crashes,
                "worker keeps crashing, giving up"
            );
            break true;
        }
        warn!(pool = %shared.label, worker = id, code = ?exit.code, "worker crashed, restarting");
        shared.publish(PoolEvent::Restarted { worker: id, exit });

        let backoff = shared.options.restart.backoff;
        if !backoff.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = control.changed() => {}
            }
        }
    };

    shared.worker_finished(id, forced);
}

async fn run_connection(
    shared: &Shared,
    id: WorkerId,
    conn: WorkerConnection,
    control: &mut watch::Receiver<Mode>,
    crashes: &mut u32,
) -> ConnectionEnd {
    let WorkerConnection {
        commands,
        mut messages,
        mut exit,
        kill,
    } = conn;
    let mut kill = Some(kill);
    let mut messages_open = true;
    let mut stopping: Option<Mode> = None;
    let mut deadline: Option<Instant> = None;
    let grace = shared.options.kill_grace;

    loop {
        let mode = *control.borrow_and_update();
        if mode != Mode::Run && stopping != Some(mode) {
            if stopping.is_none() {
                debug!(pool = %shared.label, worker = id, "asking worker to exit");
                shared.set_state(id, WorkerState::Stopping);
                let _ = commands.send(ParentMessage::Exit);
                deadline = Some(Instant::now() + grace);
            }
            stopping = Some(mode);
        }

        tokio::select! {
            message = messages.recv(), if messages_open => match message {
                Some(message) => {
                    if shared.handle_message(id, message) {
                        *crashes = 0;
                    }
                }
                None => messages_open = false,
            },
            status = &mut exit => {
                let status = status.unwrap_or(WorkerExit { code: None, killed: true });
                while let Ok(message) = messages.try_recv() {
                    shared.handle_message(id, message);
                }
                return match stopping {
                    Some(_) => ConnectionEnd::Stopped { forced: !status.success() },
                    None => ConnectionEnd::Exited(status),
                };
            }
            changed = control.changed(), if stopping != Some(Mode::Kill) => {
                if changed.is_err() {
                    stopping = Some(Mode::Kill);
                    deadline = Some(Instant::now());
                }
            }
            () = wait_deadline(deadline), if deadline.is_some() => {
                if let Some(kill) = kill.take() {
                    warn!(pool = %shared.label, worker = id, "worker did not exit in time, killing it");
                    let _ = kill.send(());
                    deadline = Some(Instant::now() + grace);
                } else {
                    error!(pool = %shared.label, worker = id, "worker did not die after kill, abandoning it");
                    return ConnectionEnd::Stopped { forced: true };
                }
            }
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
