//! Per-account pool registry: at most one supervised worker pool per token.
//!
//! A dispatch either finds the account already served, or registers a new
//! [`ProcessSupervisor`] and a watcher that tears the registration down when
//! the pool stops. The watcher is the only place where the outcome of a pool
//! is persisted: a credential failure flags the token the moment it is
//! reported, while the pool keeps running. A kill removes the registration
//! first so the watcher of a killed pool persists nothing. Jobs pushed while a
//! pool was draining are picked up by a fresh pool once the old one is gone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::{debug, error, info, warn};

use crate::core::{
    DurableQueue, PoolEvent, ProcessSupervisor, ProviderError, RetryPolicy, SupervisorOptions, Token,
    TokenCache, TokenStore, WorkerLauncher, WorkerStartup,
};

/// Abstraction for spawning background work on a runtime.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// How a dispatch request ended, handed to its finalize callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The pool drained; `require_refresh` is set when a credential failure was
    /// reported and persisted.
    Drained {
        /// The token was flagged for a credential refresh.
        require_refresh: bool,
    },
    /// The pool was killed.
    Killed,
    /// A pool already serves the token.
    AlreadyActive,
    /// The token does not exist.
    UnknownToken,
    /// The dispatcher is shutting down.
    Closed,
}

/// Immediate answer of [`AccountQueueDispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// A new pool was started.
    Started,
    /// A pool already serves the token; nothing was started.
    AlreadyActive,
    /// The token does not exist.
    UnknownToken,
    /// The dispatcher is shutting down; nothing was started.
    Closed,
}

/// Callback acknowledging a dispatch request once its pool is gone.
pub type Finalize = Box<dyn FnOnce(DispatchOutcome) + Send + 'static>;

/// Settings shared by every account pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Prefix of every account queue name.
    pub app_name: String,
    /// Downstream API base URL handed to workers.
    pub api_url: String,
    /// Jobs each worker runs at once.
    pub concurrency: usize,
    /// Worker idle poll interval, in milliseconds.
    pub idle_poll_ms: u64,
    /// Policy of task jobs pushed by update cycles.
    pub task_policy: RetryPolicy,
    /// Pool size and termination settings.
    pub supervisor: SupervisorOptions,
}

impl PoolSettings {
    /// Durable queue name of an account: `<app_name>:<account_name>`.
    #[must_use]
    pub fn queue_name(&self, account_name: &str) -> String {
        format!("{}:{account_name}", self.app_name)
    }

    fn startup(&self, token: &Token) -> WorkerStartup {
        WorkerStartup {
            access_token: token.access_token.clone(),
            account_name: token.account_name.clone(),
            queue_name: self.queue_name(&token.account_name),
            api_url: self.api_url.clone(),
            concurrency: self.concurrency,
            idle_poll_ms: self.idle_poll_ms,
            task_policy: self.task_policy,
        }
    }
}

struct Registration {
    supervisor: Arc<ProcessSupervisor>,
    queue_name: String,
    finalize: Finalize,
}

struct Inner<S> {
    store: Arc<dyn TokenStore>,
    queue: Arc<dyn DurableQueue>,
    cache: TokenCache,
    launcher: Arc<dyn WorkerLauncher>,
    settings: PoolSettings,
    registry: Mutex<HashMap<String, Registration>>,
    closed: AtomicBool,
    spawner: S,
}

/// Starts, tracks and kills account pools.
pub struct AccountQueueDispatcher<S> {
    inner: Arc<Inner<S>>,
}

impl<S> AccountQueueDispatcher<S>
where
    S: Spawn + Send + Sync + 'static,
{
    /// Create a dispatcher with an empty registry.
    pub fn new(
        store: Arc<dyn TokenStore>,
        queue: Arc<dyn DurableQueue>,
        cache: TokenCache,
        launcher: Arc<dyn WorkerLauncher>,
        settings: PoolSettings,
        spawner: S,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                queue,
                cache,
                launcher,
                settings,
                registry: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                spawner,
            }),
        }
    }

    /// Make sure a pool serves `access_token`.
    ///
    /// `finalize` runs once the request is settled: right away when the token
    /// is unknown or already served, otherwise when the new pool stops.
    ///
    /// # Errors
    ///
    /// Store failures while resolving the token, or a startup payload that
    /// cannot be serialized.
    pub async fn dispatch(&self, access_token: &str, finalize: Finalize) -> Result<DispatchStatus, ProviderError> {
        dispatch(Arc::clone(&self.inner), access_token.to_string(), finalize).await
    }

    /// Kill the pool serving `access_token` and purge its queue.
    ///
    /// Returns `false` when no pool was registered. Nothing is persisted for
    /// a killed pool.
    ///
    /// # Errors
    ///
    /// Queue failures while purging.
    pub async fn kill(&self, access_token: &str) -> Result<bool, ProviderError> {
        let registration = self.inner.registry.lock().remove(access_token);
        let Some(registration) = registration else {
            return Ok(false);
        };
        let stop = registration.supervisor.kill().await;
        let purged = self.inner.queue.purge(&registration.queue_name).await?;
        info!(
            queue = %registration.queue_name,
            purged,
            forced = stop.forced,
            "account pool killed"
        );
        (registration.finalize)(DispatchOutcome::Killed);
        Ok(true)
    }

    /// Whether a pool currently serves `access_token`.
    #[must_use]
    pub fn is_active(&self, access_token: &str) -> bool {
        self.inner.registry.lock().contains_key(access_token)
    }

    /// Queue names of every registered pool.
    #[must_use]
    pub fn active_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .inner
            .registry
            .lock()
            .values()
            .map(|r| r.queue_name.clone())
            .collect();
        queues.sort();
        queues
    }

    /// Supervisor of the pool serving `access_token`.
    #[must_use]
    pub fn supervisor(&self, access_token: &str) -> Option<Arc<ProcessSupervisor>> {
        self.inner
            .registry
            .lock()
            .get(access_token)
            .map(|r| Arc::clone(&r.supervisor))
    }

    /// Shared pool settings.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Stop accepting dispatches and drain every registered pool.
    ///
    /// Workers finish their in-flight jobs and exit; jobs left on the queues
    /// stay there for the next start. Returns once every pool has stopped.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let supervisors: Vec<Arc<ProcessSupervisor>> = self
            .inner
            .registry
            .lock()
            .values()
            .map(|r| Arc::clone(&r.supervisor))
            .collect();
        info!(pools = supervisors.len(), "draining account pools");
        for supervisor in &supervisors {
            supervisor.drain();
        }
        join_all(supervisors.iter().map(|s| s.wait_stopped())).await;
    }
}

fn dispatch<S>(
    inner: Arc<Inner<S>>,
    access_token: String,
    finalize: Finalize,
) -> BoxFuture<'static, Result<DispatchStatus, ProviderError>>
where
    S: Spawn + Send + Sync + 'static,
{
    async move {
        if inner.closed.load(Ordering::Acquire) {
            debug!("dispatch refused, dispatcher closed");
            finalize(DispatchOutcome::Closed);
            return Ok(DispatchStatus::Closed);
        }
        let token = match inner.cache.get(&access_token) {
            Some(token) => Some(token),
            None => {
                let token = inner.store.find_by_access_token(&access_token).await?;
                if let Some(token) = &token {
                    inner.cache.put_token(token);
                }
                token
            }
        };
        let Some(token) = token else {
            debug!("dispatch for unknown token skipped");
            finalize(DispatchOutcome::UnknownToken);
            return Ok(DispatchStatus::UnknownToken);
        };

        let startup = inner.settings.startup(&token);
        let payload = serde_json::to_value(&startup).map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let supervisor = {
            let mut registry = inner.registry.lock();
            if registry.contains_key(&access_token) {
                drop(registry);
                debug!(account = %token.account_name, "pool already active");
                finalize(DispatchOutcome::AlreadyActive);
                return Ok(DispatchStatus::AlreadyActive);
            }
            let supervisor = Arc::new(ProcessSupervisor::new(
                token.account_name.clone(),
                Arc::clone(&inner.launcher),
                payload,
                inner.settings.supervisor.clone(),
            ));
            registry.insert(
                access_token.clone(),
                Registration {
                    supervisor: Arc::clone(&supervisor),
                    queue_name: startup.queue_name.clone(),
                    finalize,
                },
            );
            supervisor
        };

        info!(
            account = %token.account_name,
            queue = %startup.queue_name,
            workers = inner.settings.supervisor.workers,
            "starting account pool"
        );
        let events = supervisor.subscribe();
        supervisor.start();
        inner.spawner.spawn(watch_pool(
            Arc::clone(&inner),
            access_token,
            startup.queue_name,
            supervisor,
            events,
        ));
        Ok(DispatchStatus::Started)
    }
    .boxed()
}

async fn watch_pool<S>(
    inner: Arc<Inner<S>>,
    access_token: String,
    queue_name: String,
    supervisor: Arc<ProcessSupervisor>,
    mut events: broadcast::Receiver<PoolEvent>,
) where
    S: Spawn + Send + Sync + 'static,
{
    let mut require_refresh = false;
    let stop = loop {
        tokio::select! {
            stop = supervisor.wait_stopped() => break stop,
            event = events.recv() => match event {
                Ok(event) => {
                    if !require_refresh && is_credential_failure(&event) {
                        require_refresh = flag_require_refresh(&inner, &access_token, &supervisor).await;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(pool = %supervisor.label(), missed, "pool events lagged");
                }
                Err(RecvError::Closed) => break supervisor.wait_stopped().await,
            },
        }
    };
    loop {
        match events.try_recv() {
            Ok(event) => {
                if !require_refresh && is_credential_failure(&event) {
                    require_refresh = flag_require_refresh(&inner, &access_token, &supervisor).await;
                }
            }
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }

    let registration = {
        let mut registry = inner.registry.lock();
        match registry.get(&access_token) {
            Some(current) if Arc::ptr_eq(&current.supervisor, &supervisor) => registry.remove(&access_token),
            _ => None,
        }
    };
    let Some(registration) = registration else {
        // Killed; the kill path already finalized.
        return;
    };

    if stop.forced {
        (registration.finalize)(DispatchOutcome::Killed);
        return;
    }

    if require_refresh {
        // An update cycle finalizing concurrently may have saved over the flag.
        persist_require_refresh(inner.store.as_ref(), &access_token).await;
    }
    info!(
        pool = %supervisor.label(),
        require_refresh,
        restarts = supervisor.restarts(),
        "account pool drained"
    );
    (registration.finalize)(DispatchOutcome::Drained { require_refresh });

    if inner.closed.load(Ordering::Acquire) {
        return;
    }
    match inner.queue.depth(&queue_name).await {
        Ok(depth) if !depth.is_drained() => {
            info!(queue = %queue_name, pending = depth.total(), "jobs arrived while draining, restarting pool");
            let noop: Finalize = Box::new(|_| {});
            if let Err(err) = dispatch(Arc::clone(&inner), access_token, noop).await {
                error!(queue = %queue_name, error = %err, "failed to restart account pool");
            }
        }
        Ok(_) => {}
        Err(err) => error!(queue = %queue_name, error = %err, "failed to inspect queue after drain"),
    }
}

/// Flag the token as soon as a credential failure is reported, unless the
/// pool was killed in the meantime.
async fn flag_require_refresh<S>(inner: &Inner<S>, access_token: &str, supervisor: &Arc<ProcessSupervisor>) -> bool {
    let registered = inner
        .registry
        .lock()
        .get(access_token)
        .is_some_and(|current| Arc::ptr_eq(&current.supervisor, supervisor));
    if !registered {
        return false;
    }
    let flagged = persist_require_refresh(inner.store.as_ref(), access_token).await;
    if flagged {
        inner.cache.remove(access_token);
        warn!(pool = %supervisor.label(), "credential failure reported, token requires a refresh");
    }
    flagged
}

fn is_credential_failure(event: &PoolEvent) -> bool {
    matches!(event, PoolEvent::Job { outcome, .. } if outcome.is_credential_failure())
}

/// Re-reads the token so mutations made by the workers are kept.
async fn persist_require_refresh(store: &dyn TokenStore, access_token: &str) -> bool {
    let mut token = match store.find_by_access_token(access_token).await {
        Ok(Some(token)) => token,
        Ok(None) => return false,
        Err(err) => {
            error!(error = %err, "failed to reload token");
            return false;
        }
    };
    if token.require_refresh {
        return true;
    }
    token.mark_require_refresh();
    match store.save(&token).await {
        Ok(()) => true,
        Err(err) => {
            error!(account = %token.account_name, error = %err, "failed to persist refresh flag");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        Delta, DeltaGenerator, Integration, ParentMessage, ProcessorDeps, QueueJob, RestartPolicy, ScratchCache,
        SubQueues, TaskContext, TaskError, TaskJob, TaskWorker, WorkerConnection, WorkerExit, WorkerId,
        WorkerMessage,
    };
    use crate::infra::{InMemoryDurableQueue, InMemoryTokenStore};
    use crate::runtime::{InProcessLauncher, TokioSpawner, WorkerHost};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot, Semaphore};

    const QUEUE: &str = "test:alice";

    struct NoDelta;

    #[async_trait]
    impl DeltaGenerator for NoDelta {
        async fn retrieve(&self, _: Value, _: Option<Value>, _: SubQueues) -> Result<Delta, TaskError> {
            Ok(Delta::default())
        }
    }

    /// Completes, fails with a credential error on `denied`, waits on `hold`
    /// for `slow`.
    struct Upload {
        hold: Arc<Semaphore>,
    }

    #[async_trait]
    impl TaskWorker for Upload {
        async fn process(&self, ctx: TaskContext) -> Result<(), TaskError> {
            match ctx.task["identifier"].as_str() {
                Some("denied") => Err(TaskError::Credential("401".into())),
                Some("slow") => {
                    self.hold.acquire().await.map_err(TaskError::transient)?.forget();
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn concurrency(&self) -> usize {
            2
        }
    }

    /// Workers that report a fixed busy state, never touch the queue and exit
    /// when asked.
    struct Idler {
        processing: bool,
        launches: AtomicUsize,
    }

    impl Idler {
        fn new(processing: bool) -> Arc<Self> {
            Arc::new(Self {
                processing,
                launches: AtomicUsize::new(0),
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    impl WorkerLauncher for Idler {
        fn launch(&self, _id: WorkerId) -> Result<WorkerConnection, ProviderError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let processing = self.processing;
            let (commands, mut inbox) = mpsc::unbounded_channel::<ParentMessage>();
            let (outbox, messages) = mpsc::unbounded_channel::<WorkerMessage>();
            let (exit_tx, exit) = oneshot::channel();
            let (kill, kill_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                let serve = async {
                    while let Some(message) = inbox.recv().await {
                        match message {
                            ParentMessage::Start { .. } => {
                                let _ = outbox.send(WorkerMessage::State { processing });
                            }
                            ParentMessage::Exit => break,
                        }
                    }
                };
                let killed = tokio::select! {
                    () = serve => false,
                    _ = kill_rx => true,
                };
                let code = if killed { None } else { Some(0) };
                let _ = exit_tx.send(WorkerExit { code, killed });
            });
            Ok(WorkerConnection {
                commands,
                messages,
                exit,
                kill,
            })
        }
    }

    fn settings() -> PoolSettings {
        PoolSettings {
            app_name: "test".into(),
            api_url: "http://localhost".into(),
            concurrency: 2,
            idle_poll_ms: 5,
            task_policy: RetryPolicy {
                attempts: 1,
                delay_ms: 0,
                exponential: false,
                timeout_ms: 5_000,
            },
            supervisor: SupervisorOptions {
                workers: 1,
                kill_grace: Duration::from_millis(100),
                restart: RestartPolicy::default(),
            },
        }
    }

    async fn backends() -> (Arc<InMemoryTokenStore>, Arc<InMemoryDurableQueue>) {
        let store = Arc::new(InMemoryTokenStore::new());
        store.save(&Token::new("tok", "alice", json!({}))).await.unwrap();
        (store, Arc::new(InMemoryDurableQueue::new()))
    }

    fn in_process(
        store: &Arc<InMemoryTokenStore>,
        queue: &Arc<InMemoryDurableQueue>,
        hold: &Arc<Semaphore>,
    ) -> Arc<dyn WorkerLauncher> {
        let host = WorkerHost::new(ProcessorDeps {
            store: store.clone(),
            queue: queue.clone(),
            integration: Integration::new(NoDelta).with_worker("additions", Upload { hold: hold.clone() }),
            token_cache: TokenCache::new(8, Duration::from_secs(60)),
            scratch: ScratchCache::new(8, Duration::from_secs(60)),
        });
        Arc::new(InProcessLauncher::new(Arc::new(host)))
    }

    fn dispatcher(
        store: &Arc<InMemoryTokenStore>,
        queue: &Arc<InMemoryDurableQueue>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> AccountQueueDispatcher<TokioSpawner> {
        AccountQueueDispatcher::new(
            store.clone(),
            queue.clone(),
            TokenCache::new(8, Duration::from_secs(60)),
            launcher,
            settings(),
            TokioSpawner::current(),
        )
    }

    fn recorder() -> (Finalize, mpsc::UnboundedReceiver<DispatchOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
            rx,
        )
    }

    /// Next finalize call, or `None` once the callback is gone.
    async fn settled(rx: &mut mpsc::UnboundedReceiver<DispatchOutcome>) -> Option<DispatchOutcome> {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("finalize was not called")
    }

    async fn push_task(queue: &InMemoryDurableQueue, identifier: &str) {
        let job = QueueJob::Task(TaskJob {
            access_token: "tok".into(),
            task_type: "additions".into(),
            payload: json!({ "identifier": identifier }),
        });
        queue.push(QUEUE, job, settings().task_policy).await.unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_token_starts_nothing() {
        let (store, queue) = backends().await;
        let idler = Idler::new(false);
        let dispatcher = dispatcher(&store, &queue, idler.clone());
        let (finalize, mut outcomes) = recorder();

        let status = dispatcher.dispatch("revoked", finalize).await.unwrap();

        assert_eq!(status, DispatchStatus::UnknownToken);
        assert_eq!(settled(&mut outcomes).await, Some(DispatchOutcome::UnknownToken));
        assert_eq!(settled(&mut outcomes).await, None);
        assert!(!dispatcher.is_active("revoked"));
        assert_eq!(idler.launches(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drained_pool_finalizes_once_and_unregisters() {
        let (store, queue) = backends().await;
        let hold = Arc::new(Semaphore::new(0));
        let dispatcher = dispatcher(&store, &queue, in_process(&store, &queue, &hold));
        push_task(&queue, "a").await;
        push_task(&queue, "slow").await;

        let (finalize, mut outcomes) = recorder();
        assert_eq!(dispatcher.dispatch("tok", finalize).await.unwrap(), DispatchStatus::Started);
        assert_eq!(dispatcher.active_queues(), vec![QUEUE.to_string()]);

        let (again, mut again_outcomes) = recorder();
        assert_eq!(dispatcher.dispatch("tok", again).await.unwrap(), DispatchStatus::AlreadyActive);
        assert_eq!(settled(&mut again_outcomes).await, Some(DispatchOutcome::AlreadyActive));

        hold.add_permits(1);
        assert_eq!(
            settled(&mut outcomes).await,
            Some(DispatchOutcome::Drained { require_refresh: false })
        );
        assert_eq!(settled(&mut outcomes).await, None);
        assert!(!dispatcher.is_active("tok"));
        assert!(queue.depth(QUEUE).await.unwrap().is_drained());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn credential_failure_flags_the_token_while_the_pool_runs() {
        let (store, queue) = backends().await;
        let hold = Arc::new(Semaphore::new(0));
        let dispatcher = dispatcher(&store, &queue, in_process(&store, &queue, &hold));
        push_task(&queue, "denied").await;
        push_task(&queue, "slow").await;

        let (finalize, mut outcomes) = recorder();
        dispatcher.dispatch("tok", finalize).await.unwrap();

        let mut flagged = false;
        for _ in 0..500 {
            let token = store.find_by_access_token("tok").await.unwrap().unwrap();
            if token.require_refresh {
                flagged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flagged);
        assert!(dispatcher.is_active("tok"));

        hold.add_permits(1);
        assert_eq!(
            settled(&mut outcomes).await,
            Some(DispatchOutcome::Drained { require_refresh: true })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_finalizes_as_killed_and_purges_the_queue() {
        let (store, queue) = backends().await;
        let hold = Arc::new(Semaphore::new(0));
        let dispatcher = dispatcher(&store, &queue, in_process(&store, &queue, &hold));
        push_task(&queue, "slow").await;
        push_task(&queue, "slow").await;
        push_task(&queue, "later").await;

        let (finalize, mut outcomes) = recorder();
        dispatcher.dispatch("tok", finalize).await.unwrap();
        for _ in 0..500 {
            if queue.depth(QUEUE).await.unwrap().in_flight == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(dispatcher.kill("tok").await.unwrap());
        assert_eq!(settled(&mut outcomes).await, Some(DispatchOutcome::Killed));
        assert_eq!(settled(&mut outcomes).await, None);
        assert!(!dispatcher.is_active("tok"));
        assert_eq!(queue.depth(QUEUE).await.unwrap().total(), 0);
        assert!(!dispatcher.kill("tok").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jobs_left_after_a_drain_start_a_fresh_pool() {
        let (store, queue) = backends().await;
        let idler = Idler::new(false);
        let dispatcher = dispatcher(&store, &queue, idler.clone());
        push_task(&queue, "stranded").await;

        let (finalize, mut outcomes) = recorder();
        dispatcher.dispatch("tok", finalize).await.unwrap();
        assert_eq!(
            settled(&mut outcomes).await,
            Some(DispatchOutcome::Drained { require_refresh: false })
        );

        eventually(|| idler.launches() >= 2).await;
        queue.purge(QUEUE).await.unwrap();
        eventually(|| !dispatcher.is_active("tok")).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drains_busy_pools_and_refuses_new_dispatches() {
        let (store, queue) = backends().await;
        let dispatcher = dispatcher(&store, &queue, Idler::new(true));
        push_task(&queue, "kept").await;

        let (finalize, mut outcomes) = recorder();
        dispatcher.dispatch("tok", finalize).await.unwrap();
        dispatcher.shutdown().await;

        assert_eq!(
            settled(&mut outcomes).await,
            Some(DispatchOutcome::Drained { require_refresh: false })
        );
        eventually(|| !dispatcher.is_active("tok")).await;
        assert_eq!(queue.depth(QUEUE).await.unwrap().ready, 1);

        let (late, mut late_outcomes) = recorder();
        assert_eq!(dispatcher.dispatch("tok", late).await.unwrap(), DispatchStatus::Closed);
        assert_eq!(settled(&mut late_outcomes).await, Some(DispatchOutcome::Closed));
    }
}
