//! Replan: diffing running services against a freshly layered plan.

use std::{
    fs,
    sync::{Arc, mpsc},
    time::Duration,
};

use tempfile::{TempDir, tempdir};
use warden::{
    plan::{Layer, PlanManager},
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
    marker_dir: std::path::PathBuf,
}

fn harness(layer_yaml: &str) -> Harness {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("layers dir");
    let marker_dir = dir.path().to_path_buf();
    fs::write(
        layers.join("001-base.yaml"),
        layer_yaml.replace("{dir}", marker_dir.to_str().expect("utf8 path")),
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

    Harness {
        _dir: dir,
        _shutdown_rx: shutdown_rx,
        store,
        planner,
        runner,
        services,
        marker_dir,
    }
}

fn settle(harness: &Harness, change_id: &str) -> Status {
    harness.runner.ensure();
    harness
        .store
        .wait_change(change_id, Duration::from_secs(30))
        .expect("change settles")
        .status
}

fn marker_count(harness: &Harness, name: &str) -> usize {
    fs::read_to_string(harness.marker_dir.join(name))
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

const LAYER: &str = r#"
services:
  test1:
    command: /bin/sh -c "echo run >> {dir}/test1; exec sleep 30"
    startup: enabled
  test2:
    command: /bin/sh -c "echo run >> {dir}/test2; exec sleep 30"
    startup: enabled
"#;

#[test]
fn replan_restarts_only_changed_services() {
    let harness = harness(LAYER);

    let autostart = harness.services.autostart().expect("autostart change");
    assert_eq!(settle(&harness, &autostart), Status::Done);
    assert_eq!(marker_count(&harness, "test1"), 1);
    assert_eq!(marker_count(&harness, "test2"), 1);

    // Change test2's command through an override layer.
    let override_yaml = format!(
        r#"
services:
  test2:
    override: merge
    command: /bin/sh -c "echo changed >> {}/test2; exec sleep 30"
"#,
        harness.marker_dir.display()
    );
    let layer = Layer::parse("override", 0, &override_yaml).expect("layer");
    harness.planner.append_layer(layer).expect("append");

    let (stops, starts) = harness.services.replan().expect("replan diff");
    assert_eq!(stops, vec!["test2".to_string()]);
    assert_eq!(starts, vec!["test1".to_string(), "test2".to_string()]);

    let change_id = harness.services.replan_change().expect("replan change");

    // The change sequences the stop ahead of every start.
    {
        let st = harness.store.lock();
        let tasks = st.change_tasks(&change_id).expect("tasks");
        let summaries: Vec<&str> = tasks.iter().map(|t| t.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec![
                "Stop service \"test2\"",
                "Start service \"test1\"",
                "Start service \"test2\"",
            ]
        );
        assert!(tasks[1].wait_tasks.contains(&tasks[0].id));
        assert!(tasks[2].wait_tasks.contains(&tasks[0].id));
    }

    assert_eq!(settle(&harness, &change_id), Status::Done);

    // test1 kept its process; test2 restarted with the new command.
    assert_eq!(marker_count(&harness, "test1"), 1);
    assert_eq!(marker_count(&harness, "test2"), 2);
    assert_eq!(harness.services.state_of("test1"), Some(ServiceState::Running));
    assert_eq!(harness.services.state_of("test2"), Some(ServiceState::Running));

    let config = harness.services.config("test2").expect("config");
    assert!(config.command.contains("echo changed"));

    harness.services.stop_all_active();
}

#[test]
fn replan_with_no_changes_is_a_clean_noop() {
    let harness = harness(LAYER);

    let autostart = harness.services.autostart().expect("autostart change");
    assert_eq!(settle(&harness, &autostart), Status::Done);

    let (stops, starts) = harness.services.replan().expect("replan diff");
    assert!(stops.is_empty());
    assert_eq!(starts, vec!["test1".to_string(), "test2".to_string()]);

    let change_id = harness.services.replan_change().expect("replan change");
    assert_eq!(settle(&harness, &change_id), Status::Done);

    // No service was restarted.
    assert_eq!(marker_count(&harness, "test1"), 1);
    assert_eq!(marker_count(&harness, "test2"), 1);

    harness.services.stop_all_active();
}
