//! Service log capture: bounded tails and live follows.

use std::{
    fs,
    sync::{Arc, Mutex, atomic::AtomicBool, mpsc},
    time::{Duration, Instant},
};

use tempfile::{TempDir, tempdir};
use warden::{
    logs,
    plan::PlanManager,
    reaper::DirectWaiter,
    service::{ServiceManager, ShutdownRequest},
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

#[test]
fn tail_returns_labelled_entries() {
    let harness = harness(
        r#"
services:
  chatty:
    command: /bin/sh -c "echo one; echo two; echo three; sleep 30"
"#,
    );
    start_and_settle(&harness, "chatty");

    let mut iterators = harness
        .services
        .service_logs(&["chatty".to_string()], 2)
        .expect("iterators");
    let entries = logs::collect_tail(&mut iterators, 2);

    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry.service == "chatty"));
    assert_eq!(entries[0].message, "two");
    assert_eq!(entries[1].message, "three");

    harness.services.stop_all_active();
}

#[test]
fn tail_merges_two_services_by_time() {
    let harness = harness(
        r#"
services:
  early:
    command: /bin/sh -c "echo from-early; sleep 30"
  late:
    command: /bin/sh -c "echo from-late; sleep 30"
"#,
    );
    // Sequential starts give strictly ordered timestamps.
    start_and_settle(&harness, "early");
    start_and_settle(&harness, "late");

    let mut iterators = harness
        .services
        .service_logs(&[], 10)
        .expect("iterators");
    let entries = logs::collect_tail(&mut iterators, 10);

    let services: Vec<&str> = entries.iter().map(|e| e.service.as_str()).collect();
    assert_eq!(services, vec!["early", "late"]);

    harness.services.stop_all_active();
}

#[test]
fn follow_streams_output_as_it_appears() {
    let harness = harness(
        r#"
services:
  ticker:
    command: /bin/sh -c "while true; do echo tick; sleep 0.1; done"
"#,
    );
    start_and_settle(&harness, "ticker");

    let iterators = harness
        .services
        .service_logs(&["ticker".to_string()], -1)
        .expect("iterators");

    let out: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let cancel = Arc::new(AtomicBool::new(false));
    let handles = logs::follow(iterators, Arc::clone(&out), Arc::clone(&cancel));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let ticks = {
            let buf = out.lock().unwrap();
            String::from_utf8_lossy(&buf)
                .lines()
                .filter(|line| line.contains("tick"))
                .count()
        };
        if ticks >= 2 {
            break;
        }
        assert!(Instant::now() < deadline, "follow never saw two ticks");
        std::thread::sleep(Duration::from_millis(20));
    }

    cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    harness.services.stop_all_active();
}
