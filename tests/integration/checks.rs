//! Check-failure policy: a check crossing its threshold restarts the
//! services that opted in via `on-check-failure`.

use std::{
    fs,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use tempfile::{TempDir, tempdir};
use warden::{
    checks::{CheckManager, CheckStatus},
    plan::{CheckLevel, PlanManager},
    reaper::DirectWaiter,
    service::{ServiceManager, ServiceState, ShutdownRequest},
    state::{StateStore, Status, taskrunner::TaskRunner},
};

struct Harness {
    _dir: TempDir,
    _shutdown_rx: mpsc::Receiver<ShutdownRequest>,
    store: Arc<StateStore>,
    planner: Arc<PlanManager>,
    runner: Arc<TaskRunner>,
    services: Arc<ServiceManager>,
    checks: Arc<CheckManager>,
    marker: std::path::PathBuf,
}

fn harness(layer_yaml: &str) -> Harness {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("layers dir");
    let marker = dir.path().join("spawn-count");
    fs::write(
        layers.join("001-base.yaml"),
        layer_yaml.replace("{marker}", marker.to_str().expect("utf8 path")),
    )
    .expect("layer");

    let store = Arc::new(
        StateStore::load(&dir.path().join(".warden.state")).expect("state store"),
    );
    let planner = Arc::new(PlanManager::load(&layers).expect("plan"));
    let (shutdown_tx, shutdown_rx) = mpsc::channel();

    let runner = TaskRunner::new(Arc::clone(&store));
    let services = ServiceManager::new(
        Arc::clone(&store),
        Arc::clone(&planner),
        DirectWaiter::new(),
        shutdown_tx,
    );
    services.register_handlers(&runner);

    let checks = CheckManager::new();
    {
        let services = Arc::clone(&services);
        checks.set_failure_notifier(Arc::new(move |name: &str| {
            services.check_failed(name);
        }));
    }

    Harness {
        _dir: dir,
        _shutdown_rx: shutdown_rx,
        store,
        planner,
        runner,
        services,
        checks,
        marker,
    }
}

fn spawn_count(harness: &Harness) -> usize {
    fs::read_to_string(&harness.marker)
        .map(|text| text.lines().count())
        .unwrap_or(0)
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

const LAYER: &str = r#"
services:
  svc:
    command: /bin/sh -c "echo spawned >> {marker}; exec sleep 30"
    backoff-delay: 50ms
    on-check-failure:
      chk1: restart
checks:
  chk1:
    level: alive
    period: 75ms
    threshold: 1
    exec:
      command: /bin/sh -c "exit 1"
"#;

#[test]
fn failing_check_restarts_the_service_once() {
    let harness = harness(LAYER);

    // Start the service before the checks begin failing.
    start_and_settle(&harness, "svc");
    assert_eq!(spawn_count(&harness), 1);

    // Let the failing check cross its threshold; the service is SIGTERMed,
    // backs off, and restarts.
    harness.checks.plan_changed(&harness.planner.plan());

    let deadline = Instant::now() + Duration::from_secs(10);
    while spawn_count(&harness) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(spawn_count(&harness), 2, "service should restart exactly once");

    // The check stays down without recovering, so no further restarts fire.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(spawn_count(&harness), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.services.state_of("svc") != Some(ServiceState::Running)
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(harness.services.state_of("svc"), Some(ServiceState::Running));

    let infos = harness.checks.checks();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].status, CheckStatus::Down);
    assert!(!harness.checks.healthy(Some(CheckLevel::Alive), &[]));

    harness.checks.stop();
    harness.services.stop_all_active();
}

#[test]
fn services_without_the_hook_survive_check_failures() {
    let harness = harness(
        r#"
services:
  svc:
    command: /bin/sh -c "echo spawned >> {marker}; exec sleep 30"
checks:
  chk1:
    period: 75ms
    threshold: 1
    exec:
      command: /bin/sh -c "exit 1"
"#,
    );

    start_and_settle(&harness, "svc");
    harness.checks.plan_changed(&harness.planner.plan());

    // Give the check ample time to go down.
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.checks.healthy(None, &[]) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!harness.checks.healthy(None, &[]));

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(spawn_count(&harness), 1);
    assert_eq!(harness.services.state_of("svc"), Some(ServiceState::Running));

    harness.checks.stop();
    harness.services.stop_all_active();
}
