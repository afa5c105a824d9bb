//! Integration tests for crash recovery and export/import

mod common;

use botbox::engine::recovery::REASON_NOT_FOUND_ON_RECOVERY;
use botbox::engine::REASON_NOT_FOUND_ON_IMPORT;
use botbox::safety::store::StateStore;
use botbox::{
    ContainerState, Engine, EngineError, ExportBundle, ExportTarget, ResourceLimits,
};
use common::{assert_pid_invariant, shell, test_config};
use std::process::Command;
use std::time::Duration;

fn dead_pid() -> u32 {
    let mut child = Command::new("/bin/true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn test_reopen_fails_running_entry_with_dead_pid() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let id = {
        let engine = Engine::open(config.clone()).unwrap();
        engine.create(shell("lost", "sleep 30")).unwrap().id
    };

    // Simulate an engine that died while the container was running
    let store = StateStore::open(&config.storage_root, Duration::from_secs(1)).unwrap();
    store
        .transact(|registry| {
            let container = registry.containers.get_mut(&id).unwrap();
            container.attach_process(ContainerState::Running, dead_pid(), Some(1));
            Ok(())
        })
        .unwrap();

    let engine = Engine::open(config).unwrap();
    let container = engine.inspect(&id).unwrap();
    assert_eq!(container.state, ContainerState::Failed);
    assert_eq!(
        container.failure_reason.as_deref(),
        Some(REASON_NOT_FOUND_ON_RECOVERY)
    );
    assert!(container.pid.is_none());
    assert_eq!(engine.counters().recovered_entries, 1);
    assert_pid_invariant(&engine);

    // FAILED is startable again
    let restarted = engine.start(&id).unwrap();
    assert_eq!(restarted.state, ContainerState::Running);
    engine.stop(&id, None).unwrap();
}

#[test]
fn test_reopen_keeps_live_running_entry() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let first = Engine::open(config.clone()).unwrap();
    let running = first
        .start(&first.create(shell("survivor", "sleep 30")).unwrap().id)
        .unwrap();

    let second = Engine::open(config).unwrap();
    let seen = second.inspect("survivor").unwrap();
    assert_eq!(seen.state, ContainerState::Running);
    assert_eq!(seen.pid, running.pid);

    // A different engine instance can still stop it
    let stopped = second.stop("survivor", None).unwrap();
    assert_eq!(stopped.state, ContainerState::Stopped);
}

#[test]
fn test_orphaned_directories_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    drop(Engine::open(config.clone()).unwrap());

    let orphan = config.storage_root.join("containers").join("deadbeef");
    std::fs::create_dir_all(orphan.join("rootfs/app")).unwrap();
    std::fs::write(orphan.join("output.log"), "stale").unwrap();

    let _engine = Engine::open(config).unwrap();
    assert!(!orphan.exists());
}

#[test]
fn test_corrupt_registry_is_a_persistence_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    drop(Engine::open(config.clone()).unwrap());

    std::fs::write(config.storage_root.join("registry.json"), "{ not json").unwrap();
    match Engine::open(config) {
        Err(EngineError::Persistence(_)) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("corrupt registry was accepted"),
    }
}

#[test]
fn test_export_import_round_trip() {
    let source_dir = tempfile::tempdir().unwrap();
    let source = Engine::open(test_config(source_dir.path())).unwrap();
    let limits = ResourceLimits {
        memory_mb: Some(256),
        cpu_percent: Some(25),
        max_processes: Some(16),
        io_bandwidth: None,
    };
    let idle = source
        .create(shell("idle", "sleep 30").with_limits(limits.clone()))
        .unwrap();
    let live = source.create(shell("live", "sleep 30")).unwrap();
    source.start(&live.id).unwrap();

    let bundle = source.export(ExportTarget::All).unwrap();
    bundle.verify().unwrap();
    let json = bundle.to_json().unwrap();

    let target_dir = tempfile::tempdir().unwrap();
    let target = Engine::open(test_config(target_dir.path())).unwrap();
    let imported = target.import(&ExportBundle::from_json(&json).unwrap()).unwrap();
    assert_eq!(imported.len(), 2);

    let idle_copy = target.inspect(&idle.id).unwrap();
    assert_eq!(idle_copy.name, "idle");
    assert_eq!(idle_copy.state, ContainerState::Created);
    assert_eq!(idle_copy.resource_limits, limits);

    let live_copy = target.inspect(&live.id).unwrap();
    assert_eq!(live_copy.state, ContainerState::Failed);
    assert_eq!(
        live_copy.failure_reason.as_deref(),
        Some(REASON_NOT_FOUND_ON_IMPORT)
    );
    assert!(live_copy.pid.is_none());
    assert_pid_invariant(&target);

    // Importing the same bundle again conflicts and changes nothing
    assert!(matches!(
        target.import(&bundle),
        Err(EngineError::Validation(_))
    ));
    assert_eq!(target.list().len(), 2);

    source.stop(&live.id, None).unwrap();
}

#[test]
fn test_tampered_bundle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(test_config(dir.path())).unwrap();
    let container = engine.create(shell("exported", "true")).unwrap();

    let mut bundle = engine.export(ExportTarget::One("exported".into())).unwrap();
    assert_eq!(bundle.containers.len(), 1);
    bundle.containers[0].name = "renamed".to_string();

    let other_dir = tempfile::tempdir().unwrap();
    let other = Engine::open(test_config(other_dir.path())).unwrap();
    assert!(matches!(other.import(&bundle), Err(EngineError::Validation(_))));
    assert!(other.list().is_empty());
    assert!(matches!(
        engine.export(ExportTarget::One("missing".into())),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(engine.inspect(&container.id).unwrap().name, "exported");
}
