//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use botbox::{Container, ContainerSpec, ContainerState, Engine, EngineConfig};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Engine config rooted in `dir`, with cgroups pointed at a non-hierarchy
/// so every host takes the rlimit path
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_storage_root(dir.join("store"));
    config.cgroup_root = dir.join("no-cgroup");
    config.enable_metrics = false;
    config.metrics_interval_ms = 100;
    config.start_confirm_ms = 200;
    config.default_stop_timeout_ms = 2000;
    config.soft_stop_grace_ms = 500;
    config.restart_backoff_ms = 100;
    config
}

pub fn open_engine() -> (TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(test_config(dir.path())).unwrap();
    (dir, engine)
}

/// A `/bin/sh -c script` container spec
pub fn shell(name: &str, script: &str) -> ContainerSpec {
    ContainerSpec::new(name, "/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
}

/// Poll `inspect` until `done` holds or `timeout` passes
pub fn wait_for<F>(engine: &Engine, id: &str, timeout: Duration, done: F) -> Container
where
    F: Fn(&Container) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        engine.refresh().unwrap();
        let container = engine.inspect(id).unwrap();
        if done(&container) || Instant::now() >= deadline {
            return container;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

pub fn assert_pid_invariant(engine: &Engine) {
    for container in engine.list() {
        assert!(
            container.pid_invariant_holds(),
            "{} in {} has pid {:?}",
            container.name,
            container.state,
            container.pid
        );
        if container.state == ContainerState::Removed {
            panic!("REMOVED entry {} still listed", container.id);
        }
    }
}
