//! Layer files on disk: ordering, appending, combining and rollback.

use std::fs;

use tempfile::tempdir;
use warden::{
    error::PlanError,
    plan::{Layer, PlanManager},
};

fn write_layer(dir: &std::path::Path, name: &str, yaml: &str) {
    fs::write(dir.join(name), yaml).expect("write layer");
}

#[test]
fn layers_flatten_in_filename_order() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");

    write_layer(
        &layers,
        "001-base.yaml",
        "services:\n  web:\n    command: serve --port 8080\n",
    );
    write_layer(
        &layers,
        "002-override.yaml",
        "services:\n  web:\n    override: replace\n    command: serve --port 9090\n",
    );

    let manager = PlanManager::load(&layers).expect("load");
    let plan = manager.plan();
    assert_eq!(plan.services["web"].command, "serve --port 9090");
}

#[test]
fn duplicate_labels_are_rejected_on_load() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");

    write_layer(&layers, "001-base.yaml", "services: {}\n");
    write_layer(&layers, "002-base.yaml", "services: {}\n");

    match PlanManager::load(&layers) {
        Err(PlanError::LabelExists(label)) => assert_eq!(label, "base"),
        other => panic!("expected label conflict, got {other:?}"),
    }
}

#[test]
fn append_persists_a_new_layer_file() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");
    write_layer(
        &layers,
        "001-base.yaml",
        "services:\n  web:\n    command: serve\n",
    );

    let manager = PlanManager::load(&layers).expect("load");
    let layer = Layer::parse(
        "extras",
        0,
        "services:\n  worker:\n    command: crunch\n",
    )
    .expect("parse");
    let order = manager.append_layer(layer).expect("append");
    assert_eq!(order, 2);
    assert!(layers.join("002-extras.yaml").exists());

    // A fresh manager reads the same effective plan back.
    let reloaded = PlanManager::load(&layers).expect("reload");
    let plan = reloaded.plan();
    assert_eq!(plan.services.len(), 2);
    assert_eq!(plan.services["worker"].command, "crunch");
}

#[test]
fn append_rejects_existing_labels() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");
    write_layer(
        &layers,
        "001-base.yaml",
        "services:\n  web:\n    command: serve\n",
    );

    let manager = PlanManager::load(&layers).expect("load");
    let layer = Layer::parse("base", 0, "services: {}\n").expect("parse");
    assert!(matches!(
        manager.append_layer(layer),
        Err(PlanError::LabelExists(_))
    ));
}

#[test]
fn combine_merges_into_the_existing_layer_file() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");
    write_layer(
        &layers,
        "001-base.yaml",
        "services:\n  web:\n    command: serve\n    environment:\n      A: \"1\"\n",
    );

    let manager = PlanManager::load(&layers).expect("load");
    let layer = Layer::parse(
        "base",
        0,
        "services:\n  web:\n    override: merge\n    environment:\n      B: \"2\"\n",
    )
    .expect("parse");
    let order = manager.combine_layer(layer).expect("combine");
    assert_eq!(order, 1);

    let plan = manager.plan();
    assert_eq!(plan.services["web"].environment["A"], "1");
    assert_eq!(plan.services["web"].environment["B"], "2");

    // The merged layer was rewritten in place.
    let reloaded = PlanManager::load(&layers).expect("reload");
    assert_eq!(reloaded.plan().services["web"].environment["B"], "2");
}

#[test]
fn invalid_append_rolls_back_cleanly() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");
    write_layer(
        &layers,
        "001-base.yaml",
        "services:\n  web:\n    command: serve\n",
    );

    let manager = PlanManager::load(&layers).expect("load");

    // A layer that creates a dependency cycle must not stick.
    let layer = Layer::parse(
        "broken",
        0,
        r#"
services:
  web:
    override: merge
    requires: [web2]
  web2:
    command: other
    requires: [web]
"#,
    )
    .expect("parse");
    assert!(matches!(
        manager.append_layer(layer),
        Err(PlanError::DependencyCycle { .. })
    ));

    // Plan and directory are unchanged.
    assert_eq!(manager.plan().services.len(), 1);
    assert!(!layers.join("002-broken.yaml").exists());
    assert_eq!(PlanManager::load(&layers).expect("reload").plan().services.len(), 1);
}

#[test]
fn listeners_fire_on_every_successful_mutation() {
    let dir = tempdir().expect("tempdir");
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).expect("mkdir");
    write_layer(
        &layers,
        "001-base.yaml",
        "services:\n  web:\n    command: serve\n",
    );

    let manager = PlanManager::load(&layers).expect("load");
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&seen);
    manager.add_change_listener(move |plan| {
        sink.lock().unwrap().push(plan.services.len());
    });

    let layer = Layer::parse("extras", 0, "services:\n  worker:\n    command: crunch\n")
        .expect("parse");
    manager.append_layer(layer).expect("append");

    let layer = Layer::parse(
        "extras",
        0,
        "services:\n  worker:\n    override: merge\n    summary: crunches\n",
    )
    .expect("parse");
    manager.combine_layer(layer).expect("combine");

    assert_eq!(*seen.lock().unwrap(), vec![2, 2]);
}
