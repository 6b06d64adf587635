//! Supervision of real child processes
//!
//! Workers are small `sh` scripts speaking the line protocol on stdio.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use document_provider::config::WorkerCommand;
use document_provider::core::{PoolEvent, PoolStop, ProcessSupervisor, RestartPolicy, SupervisorOptions, WorkerState};
use document_provider::runtime::ProcessLauncher;
use serde_json::json;

/// Replies idle to a start payload containing "hello", then waits for exit.
const POLITE: &str = r#"
read line
case "$line" in
  *hello*) echo '{"type":"state","processing":false}' ;;
  *) exit 9 ;;
esac
while read line; do
  case "$line" in *exit*) exit 0 ;; esac
done
"#;

/// Busy forever and deaf to exit requests.
const STUBBORN: &str = r#"
read line
echo 'not json, skipped'
echo '{"type":"state","processing":true}'
exec sleep 30
"#;

fn script(body: &str) -> ProcessLauncher {
    ProcessLauncher::new(WorkerCommand::new("sh").arg("-c").arg(body))
}

fn options(workers: usize) -> SupervisorOptions {
    SupervisorOptions {
        workers,
        kill_grace: Duration::from_millis(200),
        restart: RestartPolicy::default(),
    }
}

async fn stopped(supervisor: &ProcessSupervisor) -> PoolStop {
    tokio::time::timeout(Duration::from_secs(10), supervisor.wait_stopped())
        .await
        .expect("pool did not stop")
}

fn marker() -> PathBuf {
    std::env::temp_dir().join(format!("provider-crash-{}", uuid::Uuid::new_v4()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_processes_drain_cleanly() {
    let supervisor = ProcessSupervisor::spawn("polite", Arc::new(script(POLITE)), json!({"greeting": "hello"}), options(2));

    let stop = stopped(&supervisor).await;
    assert!(!stop.forced);
    assert_eq!(supervisor.restarts(), 0);
    assert!(supervisor
        .workers()
        .iter()
        .all(|(_, state)| *state == WorkerState::Stopped { forced: false }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_process_is_respawned_with_the_same_payload() {
    let marker = marker();
    // The first run leaves a marker and crashes; the respawn behaves.
    let body = format!(
        "if [ ! -e '{path}' ]; then touch '{path}'; exit 3; fi\n{POLITE}",
        path = marker.display()
    );
    let supervisor = ProcessSupervisor::new("crashy", Arc::new(script(&body)), json!("hello"), options(1));
    let mut events = supervisor.subscribe();
    supervisor.start();

    let stop = stopped(&supervisor).await;
    assert!(!stop.forced);
    assert_eq!(supervisor.restarts(), 1);
    match events.try_recv() {
        Ok(PoolEvent::Restarted { exit, .. }) => {
            assert_eq!(exit.code, Some(3));
            assert!(!exit.killed);
        }
        other => panic!("expected a restart report, got {other:?}"),
    }
    let _ = std::fs::remove_file(marker);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_terminates_processes_that_ignore_exit() {
    let supervisor = ProcessSupervisor::spawn("stubborn", Arc::new(script(STUBBORN)), json!({}), options(2));

    // Let both workers report busy.
    for _ in 0..200 {
        let busy = supervisor
            .workers()
            .iter()
            .all(|(_, state)| *state == WorkerState::Running { processing: true });
        if busy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(supervisor.stopped().is_none());

    let stop = tokio::time::timeout(Duration::from_secs(10), supervisor.kill())
        .await
        .expect("kill hung");
    assert!(stop.forced);
    assert!(supervisor
        .workers()
        .iter()
        .all(|(_, state)| *state == WorkerState::Stopped { forced: true }));
}
