//! Service lifecycle scenarios: ordered starts, fast-exit failures and the
//! stop signal ladder.

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

fn settle(harness: &Harness, change_id: &str) -> Status {
    harness.runner.ensure();
    let change = harness
        .store
        .wait_change(change_id, Duration::from_secs(30))
        .expect("change settles");
    change.status
}

#[test]
fn start_order_follows_requires_chain() {
    let harness = harness(
        r#"
services:
  a:
    command: /bin/sh -c "sleep 30"
    requires: [b]
  b:
    command: /bin/sh -c "sleep 30"
    requires: [c]
  c:
    command: /bin/sh -c "sleep 30"
"#,
    );

    let change_id = harness
        .services
        .start(&["a".to_string()])
        .expect("start change");

    // The closure over requires produces c, b, a as chained tasks.
    {
        let st = harness.store.lock();
        let tasks = st.change_tasks(&change_id).expect("tasks");
        let summaries: Vec<&str> = tasks.iter().map(|t| t.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec![
                "Start service \"c\"",
                "Start service \"b\"",
                "Start service \"a\"",
            ]
        );
    }

    assert_eq!(settle(&harness, &change_id), Status::Done);
    for name in ["a", "b", "c"] {
        assert_eq!(
            harness.services.state_of(name),
            Some(ServiceState::Running),
            "service {name} should be running"
        );
    }

    // Tasks completed in dependency order.
    let st = harness.store.lock();
    let tasks = st.change_tasks(&change_id).expect("tasks");
    let ready: Vec<_> = tasks.iter().map(|t| t.ready_time.expect("ready")).collect();
    assert!(ready[0] <= ready[1] && ready[1] <= ready[2]);
    drop(st);

    harness.services.stop_all_active();
}

#[test]
fn fast_exit_fails_the_start_with_output() {
    let harness = harness(
        r#"
services:
  test4:
    command: /bin/sh -c "printf 'too-fast\nsecond line\n'"
"#,
    );

    let change_id = harness
        .services
        .start(&["test4".to_string()])
        .expect("start change");
    assert_eq!(settle(&harness, &change_id), Status::Error);

    assert_eq!(
        harness.services.state_of("test4"),
        Some(ServiceState::Exited)
    );

    let st = harness.store.lock();
    let tasks = st.change_tasks(&change_id).expect("tasks");
    let log = tasks[0].log.join("\n");
    assert!(
        log.contains("Most recent service output:\n    too-fast\n    second line"),
        "log was: {log}"
    );
    assert!(
        log.contains("exited quickly with code 0"),
        "log was: {log}"
    );
}

#[test]
fn starting_an_active_service_is_a_noop() {
    let harness = harness(
        r#"
services:
  web:
    command: /bin/sh -c "sleep 30"
"#,
    );

    let first = harness.services.start(&["web".to_string()]).expect("start");
    assert_eq!(settle(&harness, &first), Status::Done);

    let second = harness.services.start(&["web".to_string()]).expect("start");
    assert_eq!(settle(&harness, &second), Status::Done);
    assert_eq!(harness.services.state_of("web"), Some(ServiceState::Running));

    harness.services.stop_all_active();
    assert_eq!(harness.services.state_of("web"), Some(ServiceState::Stopped));
}

#[test]
fn stop_terminates_a_cooperative_service_quickly() {
    let harness = harness(
        r#"
services:
  quick:
    command: /bin/sh -c "sleep 30"
"#,
    );

    let start = harness.services.start(&["quick".to_string()]).expect("start");
    assert_eq!(settle(&harness, &start), Status::Done);

    let began = Instant::now();
    let stop = harness.services.stop(&["quick".to_string()]).expect("stop");
    assert_eq!(settle(&harness, &stop), Status::Done);

    assert!(began.elapsed() < Duration::from_secs(5));
    assert_eq!(
        harness.services.state_of("quick"),
        Some(ServiceState::Stopped)
    );
}

#[test]
fn stop_escalates_to_sigkill_after_kill_delay() {
    // The trap keeps the shell alive after SIGTERM, forcing escalation.
    let harness = harness(
        r#"
services:
  stubborn:
    command: /bin/sh -c "trap 'sleep 10' TERM; sleep 20 & wait $!"
    kill-delay: 300ms
"#,
    );

    let start = harness
        .services
        .start(&["stubborn".to_string()])
        .expect("start");
    assert_eq!(settle(&harness, &start), Status::Done);

    let began = Instant::now();
    let stop = harness
        .services
        .stop(&["stubborn".to_string()])
        .expect("stop");
    assert_eq!(settle(&harness, &stop), Status::Done);
    let elapsed = began.elapsed();

    assert!(
        elapsed >= Duration::from_millis(300),
        "stop finished before the kill delay: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(10),
        "stop waited out the trap handler: {elapsed:?}"
    );
    assert_eq!(
        harness.services.state_of("stubborn"),
        Some(ServiceState::Stopped)
    );
}

#[test]
fn unknown_service_cannot_start() {
    let harness = harness(
        r#"
services:
  known:
    command: /bin/sh -c "sleep 30"
"#,
    );

    assert!(harness.services.start(&["ghost".to_string()]).is_err());
}
