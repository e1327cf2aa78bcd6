//! Backoff behavior: growth across rapid failures, cancellation on stop,
//! and the quiet-period reset.

use std::{
    fs,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use tempfile::{TempDir, tempdir};
use warden::{
    plan::PlanManager,
    reaper::DirectWaiter,
    service::{ServiceManager, ServiceState, ShutdownRequest},
    state::{StateStore, Status, taskrunner::TaskRunner},
};

struct Harness {
    _dir: TempDir,
    _shutdown_rx: mpsc::Receiver<ShutdownRequest>,
    store: Arc<StateStore>,
    runner: Arc<TaskRunner>,
    services: Arc<ServiceManager>,
}

fn harness(layer_yaml: &str) -> Harness {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("layers dir");
    fs::write(layers.join("001-base.yaml"), layer_yaml).expect("layer");

    let store = Arc::new(
        StateStore::load(&dir.path().join(".warden.state")).expect("state store"),
    );
    let planner = Arc::new(PlanManager::load(&layers).expect("plan"));
    let (shutdown_tx, shutdown_rx) = mpsc::channel();

    let runner = TaskRunner::new(Arc::clone(&store));
    let services = ServiceManager::new(
        Arc::clone(&store),
        planner,
        DirectWaiter::new(),
        shutdown_tx,
    );
    services.register_handlers(&runner);

    Harness {
        _dir: dir,
        _shutdown_rx: shutdown_rx,
        store,
        runner,
        services,
    }
}

fn start_and_settle(harness: &Harness, name: &str) {
    let change_id = harness
        .services
        .start(&[name.to_string()])
        .expect("start change");
    harness.runner.ensure();
    let change = harness
        .store
        .wait_change(&change_id, Duration::from_secs(30))
        .expect("change settles");
    assert_eq!(change.status, Status::Done);
}

fn wait_for_state(harness: &Harness, name: &str, wanted: ServiceState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if harness.services.state_of(name) == Some(wanted) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "service {name} never reached {wanted:?} (currently {:?})",
            harness.services.state_of(name)
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

const LAYER: &str = r#"
services:
  flappy:
    command: /bin/sh -c "echo up; sleep 30"
    backoff-delay: 200ms
    backoff-factor: 2.0
    backoff-limit: 600ms
"#;

#[test]
fn backoff_index_grows_then_resets_after_quiet_period() {
    let harness = harness(LAYER);
    start_and_settle(&harness, "flappy");
    assert_eq!(harness.services.backoff_index("flappy"), Some(0));

    // First failure: 200ms backoff, index 1.
    harness
        .services
        .send_signal(&["flappy".to_string()], "SIGTERM")
        .expect("signal");
    wait_for_state(&harness, "flappy", ServiceState::BackoffWait);
    assert_eq!(harness.services.backoff_index("flappy"), Some(1));
    wait_for_state(&harness, "flappy", ServiceState::Running);

    // Second failure inside the quiet window: index 2, 400ms backoff.
    harness
        .services
        .send_signal(&["flappy".to_string()], "SIGTERM")
        .expect("signal");
    wait_for_state(&harness, "flappy", ServiceState::BackoffWait);
    assert_eq!(harness.services.backoff_index("flappy"), Some(2));
    wait_for_state(&harness, "flappy", ServiceState::Running);

    // Stay up well past the 400ms backoff; the next failure starts the
    // schedule over at index 1.
    std::thread::sleep(Duration::from_millis(700));
    harness
        .services
        .send_signal(&["flappy".to_string()], "SIGTERM")
        .expect("signal");
    wait_for_state(&harness, "flappy", ServiceState::BackoffWait);
    assert_eq!(harness.services.backoff_index("flappy"), Some(1));

    wait_for_state(&harness, "flappy", ServiceState::Running);
    harness.services.stop_all_active();
}

#[test]
fn stop_during_backoff_cancels_the_restart() {
    let harness = harness(LAYER);
    start_and_settle(&harness, "flappy");

    harness
        .services
        .send_signal(&["flappy".to_string()], "SIGTERM")
        .expect("signal");
    wait_for_state(&harness, "flappy", ServiceState::BackoffWait);

    let stop = harness
        .services
        .stop(&["flappy".to_string()])
        .expect("stop change");
    harness.runner.ensure();
    let change = harness
        .store
        .wait_change(&stop, Duration::from_secs(10))
        .expect("stop settles");
    assert_eq!(change.status, Status::Done);
    assert_eq!(
        harness.services.state_of("flappy"),
        Some(ServiceState::Stopped)
    );

    // No restart sneaks in afterwards.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(
        harness.services.state_of("flappy"),
        Some(ServiceState::Stopped)
    );
}

#[test]
fn failure_action_ignore_leaves_service_inactive() {
    let harness = harness(
        r#"
services:
  oneshot:
    command: /bin/sh -c "sleep 30"
    on-failure: ignore
"#,
    );
    start_and_settle(&harness, "oneshot");

    harness
        .services
        .send_signal(&["oneshot".to_string()], "SIGTERM")
        .expect("signal");
    wait_for_state(&harness, "oneshot", ServiceState::Exited);

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        harness.services.state_of("oneshot"),
        Some(ServiceState::Exited)
    );
}
