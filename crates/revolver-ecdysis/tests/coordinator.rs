//! Restart coordinator integration tests
//!
//! Drive a `RestartCoordinator` with an in-process echo service in front
//! of a real proxy and verify:
//! - the initial trigger brings up one destination and one running backend
//! - a restart retires the previous backend only after it has drained
//! - a failed attempt leaves the previous backend serving
//! - concurrent triggers are dropped, not queued
//! - shutting down during a slow first build kills the build and waits for it
//!
//! Run with: `cargo test -p revolver-ecdysis --test coordinator`

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{init_test, start_proxy, Client, EchoWorkload, DEFAULT_TIMEOUT, FAST_DRAIN};
use revolver_ecdysis::{
    ChangeEvent, ChangeKind, CommandSet, CoordinatorSettings, PortBinding, RestartCoordinator,
    RestartError, Retrigger, ReverseProxy, ScriptBundle, SupervisorState, Trigger, TriggerOutcome,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Harness {
    root: CancellationToken,
    proxy: ReverseProxy,
    addr: std::net::SocketAddr,
    workload: Arc<EchoWorkload>,
    coordinator: RestartCoordinator,
}

async fn harness() -> Harness {
    init_test();
    let root = CancellationToken::new();
    let proxy = ReverseProxy::new("127.0.0.1:0").with_drain_interval(FAST_DRAIN);
    let (addr, _serve) = start_proxy(&proxy, root.child_token()).await;
    let workload = EchoWorkload::new("HTTP_PORT");

    let settings = CoordinatorSettings {
        work_dir: std::env::temp_dir(),
        scripts: ScriptBundle::new("", "service", ""),
        ports: vec![PortBinding::new(8080, "http", "HTTP_PORT")],
        ready_timeout: Duration::from_secs(5),
    };
    let coordinator = RestartCoordinator::new(
        settings,
        vec![("http".to_string(), proxy.clone())],
        workload.clone(),
        root.clone(),
    );

    Harness {
        root,
        proxy,
        addr,
        workload,
        coordinator,
    }
}

fn changed() -> Trigger {
    Trigger::Changed(ChangeEvent::new(
        ChangeKind::Modified,
        vec!["main.go".into()],
    ))
}

#[tokio::test]
async fn test_initial_trigger_brings_up_backend() {
    let h = harness().await;

    let session = match h.coordinator.trigger(Trigger::Initial).await {
        TriggerOutcome::Completed(session) => session,
        other => panic!("initial attempt failed: {:?}", other),
    };

    assert_eq!(h.proxy.destination_names(), vec![session.to_string()]);
    assert_eq!(h.proxy.current(), Some(session.to_string()));
    assert_eq!(h.coordinator.current_session(), Some(session));

    let supervisor = h.coordinator.current_supervisor().unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(h.coordinator.live_supervisors().len(), 1);

    let (mut client, tag) = Client::connect(h.addr).await;
    assert!(tag.parse::<u16>().is_ok());
    assert_eq!(client.echo("hello").await, "hello");

    h.root.cancel();
    assert!(h.coordinator.shutdown(DEFAULT_TIMEOUT).await);
}

#[tokio::test]
async fn test_restart_retires_previous_backend_after_drain() {
    let h = harness().await;
    assert!(matches!(
        h.coordinator.trigger(Trigger::Initial).await,
        TriggerOutcome::Completed(_)
    ));
    let previous = h.coordinator.current_supervisor().unwrap();
    let (mut inflight, old_tag) = Client::connect(h.addr).await;

    let TriggerOutcome::Completed(session) = h.coordinator.trigger(changed()).await else {
        panic!("restart failed");
    };
    assert_eq!(h.proxy.current(), Some(session.to_string()));

    let (_fresh, new_tag) = Client::connect(h.addr).await;
    assert_ne!(new_tag, old_tag);

    // The open session pins the previous backend.
    tokio::time::sleep(FAST_DRAIN * 5).await;
    assert_eq!(previous.state(), SupervisorState::Running);
    assert_eq!(inflight.echo("still here").await, "still here");
    assert_eq!(h.workload.stops.load(Ordering::SeqCst), 0);

    drop(inflight);
    timeout(DEFAULT_TIMEOUT, previous.wait_for_stop())
        .await
        .expect("previous backend should be stopped after draining");
    assert_eq!(h.workload.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.destination_names(), vec![session.to_string()]);
    assert_eq!(h.coordinator.live_supervisors().len(), 1);

    h.root.cancel();
    assert!(h.coordinator.shutdown(DEFAULT_TIMEOUT).await);
}

#[tokio::test]
async fn test_failed_attempt_keeps_previous_backend() {
    let h = harness().await;
    let TriggerOutcome::Completed(session) = h.coordinator.trigger(Trigger::Initial).await else {
        panic!("initial attempt failed");
    };
    let (_client, old_tag) = Client::connect(h.addr).await;

    h.workload.fail_next_run();
    let outcome = h.coordinator.trigger(changed()).await;
    assert!(matches!(
        outcome,
        TriggerOutcome::Failed(RestartError::LaunchFailed)
    ));

    assert_eq!(h.coordinator.current_session(), Some(session));
    assert_eq!(h.proxy.destination_names(), vec![session.to_string()]);
    assert_eq!(
        h.coordinator.current_supervisor().unwrap().state(),
        SupervisorState::Running
    );

    let (_again, tag) = Client::connect(h.addr).await;
    assert_eq!(tag, old_tag);

    // The guard was released: the next trigger runs.
    assert!(matches!(
        h.coordinator.trigger(changed()).await,
        TriggerOutcome::Completed(_)
    ));

    h.root.cancel();
    assert!(h.coordinator.shutdown(DEFAULT_TIMEOUT).await);
}

#[tokio::test]
async fn test_concurrent_trigger_is_dropped() {
    let h = harness().await;

    let (first, second) = tokio::join!(
        h.coordinator.trigger(Trigger::Initial),
        h.coordinator.trigger(changed()),
    );
    assert!(matches!(first, TriggerOutcome::Completed(_)));
    assert!(matches!(second, TriggerOutcome::Dropped));

    assert_eq!(h.workload.launches.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.destination_names().len(), 1);

    h.root.cancel();
    assert!(h.coordinator.shutdown(DEFAULT_TIMEOUT).await);
}

#[tokio::test]
async fn test_root_cancellation_stops_every_backend() {
    let h = harness().await;
    assert!(matches!(
        h.coordinator.trigger(Trigger::Initial).await,
        TriggerOutcome::Completed(_)
    ));
    let (_pinned, _) = Client::connect(h.addr).await;
    assert!(matches!(
        h.coordinator.trigger(changed()).await,
        TriggerOutcome::Completed(_)
    ));
    assert_eq!(h.coordinator.live_supervisors().len(), 2);

    h.root.cancel();
    assert!(h.coordinator.shutdown(DEFAULT_TIMEOUT).await);
    assert!(h.coordinator.live_supervisors().is_empty());
    assert_eq!(h.workload.stops.load(Ordering::SeqCst), 2);

    assert!(matches!(
        h.coordinator.trigger(changed()).await,
        TriggerOutcome::Failed(RestartError::Cancelled)
    ));
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 only checks that the pid exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[tokio::test]
async fn test_cancel_during_initial_preload_kills_it() {
    init_test();
    let dir = tempfile::tempdir().unwrap();
    let root = CancellationToken::new();
    let proxy = ReverseProxy::new("127.0.0.1:0").with_drain_interval(FAST_DRAIN);
    let (_addr, _serve) = start_proxy(&proxy, root.child_token()).await;

    let settings = CoordinatorSettings {
        work_dir: dir.path().to_path_buf(),
        scripts: ScriptBundle::new(
            r#"sh -c "echo $$ > preload.pid; exec sleep 30""#,
            "sleep 30",
            "",
        ),
        ports: vec![PortBinding::new(8080, "http", "HTTP_PORT")],
        ready_timeout: Duration::from_secs(30),
    };
    let coordinator = RestartCoordinator::new(
        settings,
        vec![("http".to_string(), proxy.clone())],
        Arc::new(CommandSet::new(Duration::from_millis(200))),
        root.clone(),
    );

    coordinator.retrigger(Trigger::Initial);

    let pid_file = dir.path().join("preload.pid");
    let pid: i32 = timeout(DEFAULT_TIMEOUT, async {
        loop {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("preload should start");
    assert!(process_alive(pid));

    root.cancel();
    assert!(coordinator.shutdown(DEFAULT_TIMEOUT).await);

    assert!(!process_alive(pid), "preload should be gone after shutdown");
    assert!(coordinator.current_session().is_none());
    assert!(proxy.destination_names().is_empty());
}

#[tokio::test]
async fn test_wait_stopped_waits_for_attempt_in_progress() {
    let h = harness().await;
    let workload = h.workload.clone();

    let coordinator = h.coordinator.clone();
    let attempt = tokio::spawn(async move { coordinator.trigger(Trigger::Initial).await });
    timeout(DEFAULT_TIMEOUT, async {
        while workload.launches.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("backend should launch");

    h.root.cancel();
    assert!(h.coordinator.shutdown(DEFAULT_TIMEOUT).await);
    assert_eq!(h.workload.stops.load(Ordering::SeqCst), 1);

    let outcome = timeout(DEFAULT_TIMEOUT, attempt).await.unwrap().unwrap();
    assert!(!matches!(outcome, TriggerOutcome::Dropped));
    assert!(h.coordinator.live_supervisors().is_empty());
}

#[tokio::test]
async fn test_pinned_session_survives_consecutive_restarts() {
    let h = harness().await;
    let TriggerOutcome::Completed(first) = h.coordinator.trigger(Trigger::Initial).await else {
        panic!("initial attempt failed");
    };
    let first_supervisor = h.coordinator.current_supervisor().unwrap();
    let (mut pinned, _) = Client::connect(h.addr).await;

    for _ in 0..2 {
        assert!(matches!(
            h.coordinator.trigger(changed()).await,
            TriggerOutcome::Completed(_)
        ));
        tokio::time::sleep(FAST_DRAIN * 3).await;
        assert_eq!(h.proxy.sessions(&first.to_string()), Some(1));
        assert_eq!(first_supervisor.state(), SupervisorState::Running);
    }
    assert_eq!(pinned.echo("pinned").await, "pinned");

    drop(pinned);
    timeout(DEFAULT_TIMEOUT, first_supervisor.wait_for_stop())
        .await
        .expect("first backend should stop once its session closes");
    assert_eq!(h.proxy.sessions(&first.to_string()), None);

    h.root.cancel();
    assert!(h.coordinator.shutdown(DEFAULT_TIMEOUT).await);
}
