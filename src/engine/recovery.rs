//! Startup reconciliation of the persisted registry with live OS state.
//!
//! Runs once per [`Engine::open`](crate::Engine::open), inside a single store
//! transaction, before any operation is served.

use crate::config::types::{Container, ContainerState};
use crate::kernel::procfs;
use crate::safety::store::Registry;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const REASON_NOT_FOUND_ON_RECOVERY: &str = "process_not_found_on_recovery";

/// What reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Live-state entries whose process is gone, now FAILED
    pub failed: Vec<String>,
    /// Interrupted STARTING/STOPPING transitions settled back to RUNNING
    pub resumed: Vec<String>,
    /// Non-live entries that still carried a pid
    pub repaired: Vec<String>,
    /// `containers/<id>` directories without a registry entry
    pub orphans: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.resumed.is_empty()
            && self.repaired.is_empty()
            && self.orphans.is_empty()
    }
}

/// Reconcile every entry in `registry` against `/proc`
pub fn reconcile(registry: &mut Registry) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    for container in registry.containers.values_mut() {
        reconcile_one(container, &mut report);
    }
    report
}

fn reconcile_one(container: &mut Container, report: &mut RecoveryReport) {
    if !container.state.has_live_process() {
        if container.pid.is_some() || container.transition_owner.is_some() {
            container.pid = None;
            container.pid_start_ticks = None;
            container.transition_owner = None;
            report.repaired.push(container.id.clone());
        }
        return;
    }

    let alive = container
        .pid
        .map(|pid| procfs::process_alive(pid, container.pid_start_ticks))
        .unwrap_or(false);

    if !alive {
        log::warn!(
            "{} ({}) was {} but its process is gone",
            container.name,
            container.id,
            container.state
        );
        container.detach_process(
            ContainerState::Failed,
            None,
            Some(REASON_NOT_FOUND_ON_RECOVERY.to_string()),
        );
        report.failed.push(container.id.clone());
        return;
    }

    if container.state == ContainerState::Running {
        return;
    }

    // STARTING or STOPPING: only settle it if nobody is still driving it
    let owner_alive = container
        .transition_owner
        .map(|owner| procfs::process_alive(owner, None))
        .unwrap_or(false);
    if owner_alive {
        log::debug!(
            "{} is {} under live engine pid {:?}",
            container.id,
            container.state,
            container.transition_owner
        );
        return;
    }

    log::info!(
        "Settling interrupted {} transition of {} as RUNNING",
        container.state,
        container.id
    );
    container.state = ContainerState::Running;
    container.transition_owner = None;
    report.resumed.push(container.id.clone());
}

/// Names of entries under `containers_dir` that have no registry entry
pub fn find_orphans(registry: &Registry, containers_dir: &Path) -> Vec<String> {
    let known: HashSet<&str> = registry.containers.keys().map(String::as_str).collect();
    let entries = match fs::read_dir(containers_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !known.contains(name.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ContainerSpec;
    use std::process::Command;

    fn entry(name: &str) -> Container {
        Container::from_spec(ContainerSpec::new(name, "/bin/sh"))
    }

    fn registry_of(containers: Vec<Container>) -> Registry {
        let mut registry = Registry::default();
        for container in containers {
            registry.containers.insert(container.id.clone(), container);
        }
        registry
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("/bin/true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_dead_running_entry_fails() {
        let mut running = entry("gone");
        running.attach_process(ContainerState::Running, dead_pid(), Some(1));
        let id = running.id.clone();
        let mut registry = registry_of(vec![running]);

        let report = reconcile(&mut registry);
        assert_eq!(report.failed, vec![id.clone()]);

        let container = &registry.containers[&id];
        assert_eq!(container.state, ContainerState::Failed);
        assert_eq!(
            container.failure_reason.as_deref(),
            Some(REASON_NOT_FOUND_ON_RECOVERY)
        );
        assert!(container.pid_invariant_holds());
    }

    #[test]
    fn test_interrupted_transitions_settle_to_running() {
        let own = std::process::id();
        let ticks = procfs::read_stat(own).map(|s| s.start_ticks);

        let mut starting = entry("starting");
        starting.attach_process(ContainerState::Starting, own, ticks);
        starting.transition_owner = Some(dead_pid());

        let mut stopping = entry("stopping");
        stopping.attach_process(ContainerState::Stopping, own, ticks);
        stopping.transition_owner = None;

        let mut in_flight = entry("in-flight");
        in_flight.attach_process(ContainerState::Starting, own, ticks);
        in_flight.transition_owner = Some(own);

        let in_flight_id = in_flight.id.clone();
        let mut registry = registry_of(vec![starting, stopping, in_flight]);
        let report = reconcile(&mut registry);

        assert_eq!(report.resumed.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(
            registry.containers[&in_flight_id].state,
            ContainerState::Starting
        );
        for container in registry.containers.values() {
            assert!(container.pid_invariant_holds());
        }
    }

    #[test]
    fn test_stale_pid_on_stopped_entry_is_cleared() {
        let mut stopped = entry("stopped");
        stopped.pid = Some(12345);
        let mut registry = registry_of(vec![stopped]);

        let report = reconcile(&mut registry);
        assert_eq!(report.repaired.len(), 1);
        assert!(registry.containers.values().all(|c| c.pid.is_none()));
    }

    #[test]
    fn test_orphans_are_found() {
        let dir = tempfile::tempdir().unwrap();
        let known = entry("known");
        fs::create_dir(dir.path().join(&known.id)).unwrap();
        fs::create_dir(dir.path().join("deadbeef")).unwrap();
        let registry = registry_of(vec![known]);

        assert_eq!(find_orphans(&registry, dir.path()), vec!["deadbeef".to_string()]);
    }
}
