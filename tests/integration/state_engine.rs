//! State persistence across daemon lifetimes and engine-driven waits.

use std::{
    fs,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use tempfile::tempdir;
use warden::{
    error::{DaemonError, StateError},
    plan::PlanManager,
    reaper::DirectWaiter,
    restart,
    service::ServiceManager,
    state::{StateStore, Status, taskrunner::TaskRunner},
};

#[test]
fn completed_changes_survive_a_reload() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");
    fs::write(
        layers.join("001-base.yaml"),
        "services:\n  web:\n    command: /bin/sh -c \"sleep 30\"\n",
    )
    .expect("layer");
    let state_path = dir.path().join(".warden.state");

    let change_id = {
        let store = Arc::new(StateStore::load(&state_path).expect("state store"));
        let planner = Arc::new(PlanManager::load(&layers).expect("plan"));
        let (shutdown_tx, _shutdown_rx) = mpsc::channel();
        let runner = TaskRunner::new(Arc::clone(&store));
        let services = ServiceManager::new(
            Arc::clone(&store),
            planner,
            DirectWaiter::new(),
            shutdown_tx,
        );
        services.register_handlers(&runner);

        let change_id = services.start(&["web".to_string()]).expect("start change");
        runner.ensure();
        let change = store
            .wait_change(&change_id, Duration::from_secs(30))
            .expect("change settles");
        assert_eq!(change.status, Status::Done);

        services.stop_all_active();
        runner.stop();
        change_id
    };

    // The monitor threads briefly hold store references; retry until the
    // exclusive state lock is free again.
    let deadline = Instant::now() + Duration::from_secs(5);
    let reloaded = loop {
        match StateStore::load(&state_path) {
            Ok(store) => break store,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50))
            }
            Err(err) => panic!("cannot reload state store: {err}"),
        }
    };

    let st = reloaded.lock();
    let change = st.change(&change_id).expect("change persisted");
    assert_eq!(change.status, Status::Done);
    assert_eq!(change.kind, "start");
    let tasks = st.change_tasks(&change_id).expect("tasks persisted");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].summary, "Start service \"web\"");
}

#[test]
fn wait_change_times_out_on_stuck_changes() {
    let store = StateStore::in_memory();
    let change_id = {
        let mut st = store.lock();
        let change_id = st.new_change("start", "never runs");
        st.new_task(&change_id, "start", "t", vec![], Default::default())
            .expect("task");
        change_id
    };

    match store.wait_change(&change_id, Duration::from_millis(200)) {
        Err(StateError::WaitTimeout(id)) => assert_eq!(id, change_id),
        other => panic!("expected wait timeout, got {other:?}"),
    }
}

#[test]
fn pending_restart_marker_survives_reload() {
    let dir = tempdir().expect("tempdir");
    let state_path = dir.path().join(".warden.state");

    {
        let store = StateStore::load(&state_path).expect("state store");
        restart::note_restart_pending(&store).expect("note");
    }

    // Same boot id: the reloaded daemon refuses to proceed silently.
    let store = StateStore::load(&state_path).expect("reload");
    match restart::verify_boot(&store) {
        Err(DaemonError::SystemRestartMissing { attempt }) => assert_eq!(attempt, 1),
        other => panic!("expected missing-restart error, got {other:?}"),
    }

    drop(store);
    let store = StateStore::load(&state_path).expect("reload again");
    match restart::verify_boot(&store) {
        Err(DaemonError::SystemRestartMissing { attempt }) => assert_eq!(attempt, 2),
        other => panic!("expected missing-restart error, got {other:?}"),
    }
}

#[test]
fn misc_data_round_trips_through_the_file() {
    let dir = tempdir().expect("tempdir");
    let state_path = dir.path().join(".warden.state");

    {
        let store = StateStore::load(&state_path).expect("state store");
        let mut st = store.lock();
        st.set("greeting", &"hello").expect("set");
        st.warnf("low disk space");
    }

    let store = StateStore::load(&state_path).expect("reload");
    let mut st = store.lock();
    assert_eq!(
        st.get::<String>("greeting").expect("get"),
        Some("hello".to_string())
    );
    let warnings = st.all_warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].message, "low disk space");
}
