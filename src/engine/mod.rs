//! Engine facade.
//!
//! The engine is the only component that mutates [`Container`] values. Every
//! transition is one [`StateStore::transact`] cycle, so it is persisted
//! before it is acknowledged. Multi-step operations on one container (start,
//! stop, forced remove) are serialized by a per-container guard; reads are
//! served from an in-memory cache refreshed after every transaction.

pub mod export;
pub mod recovery;

use crate::config::engine::EngineConfig;
use crate::config::types::{
    Container, ContainerSpec, ContainerState, EngineError, MetricsSnapshot, ResourceLimits,
    RestartPolicy, Result,
};
use crate::config::validator;
use crate::kernel::cgroup::{detect_cgroup_backend, CgroupBackend};
use crate::kernel::confinement::WriteConfinement;
use crate::kernel::signal;
use crate::observability::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::observability::metrics::{CounterSnapshot, EngineCounters};
use crate::runtime::collector::{CollectorSink, MetricsCollector};
use crate::runtime::limits::HardLimitPlan;
use crate::runtime::sandbox::FilesystemSandbox;
use crate::runtime::supervisor::{ExitInfo, ProcessStatus, ProcessSupervisor, SpawnedProcess};
use crate::safety::store::{Registry, StateStore};
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use export::{ExportBundle, ExportTarget};
use log::{debug, error, info, warn};
use recovery::RecoveryReport;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
    Weak,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const REASON_LIMIT_EXCEEDED: &str = "resource_limit_exceeded";
pub const REASON_NOT_FOUND_ON_IMPORT: &str = "process_not_found_on_import";

const CONFIRM_POLL: Duration = Duration::from_millis(10);

/// Latest and historical usage of one container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub latest: Option<MetricsSnapshot>,
    /// Samples taken by this engine instance, oldest first
    pub history: Vec<MetricsSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartCause {
    Caller,
    Restart,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

fn entry_mut<'a>(registry: &'a mut Registry, id: &str) -> Result<&'a mut Container> {
    registry
        .containers
        .get_mut(id)
        .ok_or_else(|| EngineError::NotFound(id.to_string()))
}

fn exit_state(exit: ExitInfo) -> ContainerState {
    if exit.is_success() {
        ContainerState::Stopped
    } else {
        ContainerState::Failed
    }
}

/// The message of a spawn-class error without its variant prefix
fn error_detail(error: &EngineError) -> String {
    match error {
        EngineError::Spawn(detail) => detail.clone(),
        other => other.to_string(),
    }
}

pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct EngineInner {
    me: Weak<EngineInner>,
    config: EngineConfig,
    store: StateStore,
    sandbox: FilesystemSandbox,
    supervisor: ProcessSupervisor,
    collector: Arc<MetricsCollector>,
    cgroup: Option<Arc<dyn CgroupBackend>>,
    audit: AuditLog,
    counters: EngineCounters,
    cache: RwLock<Registry>,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown_rx: Receiver<()>,
    restart_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the store under `config.storage_root`, reconcile it with the
    /// live system and start the metrics collector.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let store = StateStore::open(&config.storage_root, config.lock_timeout())?;
        let audit = AuditLog::open(&store.audit_path())?;
        let cgroup: Option<Arc<dyn CgroupBackend>> =
            detect_cgroup_backend(&config.cgroup_root).map(Arc::from);
        let sandbox = FilesystemSandbox::new(store.containers_dir());
        let collector = Arc::new(MetricsCollector::new(
            config.metrics_history,
            cgroup.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let inner = Arc::new_cyclic(|me| EngineInner {
            me: me.clone(),
            config,
            store,
            sandbox,
            supervisor: ProcessSupervisor::new(),
            collector,
            cgroup,
            audit,
            counters: EngineCounters::default(),
            cache: RwLock::new(Registry::default()),
            guards: Mutex::new(HashMap::new()),
            shutdown_rx,
            restart_threads: Mutex::new(Vec::new()),
        });

        let report = inner.recover()?;
        if !report.is_clean() {
            info!(
                "Recovery: {} failed, {} resumed, {} repaired, {} orphans removed",
                report.failed.len(),
                report.resumed.len(),
                report.repaired.len(),
                report.orphans.len()
            );
        }

        let engine = Engine {
            inner,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            threads: Mutex::new(Vec::new()),
        };

        if engine.inner.config.enable_metrics {
            let sink: Arc<dyn CollectorSink> = engine.inner.clone();
            let handles = Arc::clone(&engine.inner.collector).spawn(
                sink,
                engine.inner.config.metrics_interval(),
                engine.inner.shutdown_rx.clone(),
            )?;
            *lock(&engine.threads) = handles;
        }

        info!(
            "Engine ready at {} (cgroups: {})",
            engine.inner.config.storage_root.display(),
            engine
                .inner
                .cgroup
                .as_ref()
                .map(|backend| backend.backend_name())
                .unwrap_or("none")
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn storage_root(&self) -> &Path {
        self.inner.store.root()
    }

    pub fn cgroups_enabled(&self) -> bool {
        self.inner.cgroup.is_some()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    /// Validate `spec` and persist a new CREATED container
    pub fn create(&self, spec: ContainerSpec) -> Result<Container> {
        self.inner.create(spec)
    }

    /// CREATED, STOPPED or FAILED → RUNNING. Resets the restart budget.
    /// A process already over its soft limits by the end of the
    /// confirmation window is stopped again and `ResourceLimitExceeded`
    /// is returned.
    pub fn start(&self, id_or_name: &str) -> Result<Container> {
        self.inner.start(id_or_name, StartCause::Caller)
    }

    /// RUNNING → STOPPED. `timeout` defaults to the configured stop timeout.
    /// A process that exited before the request is recorded as its own exit
    /// (FAILED unless code 0) and the call fails with `InvalidState`.
    pub fn stop(&self, id_or_name: &str, timeout: Option<Duration>) -> Result<Container> {
        self.inner.stop(id_or_name, timeout)
    }

    /// Purge a non-running container; `force` stops a live one first
    pub fn remove(&self, id_or_name: &str, force: bool) -> Result<Container> {
        self.inner.remove(id_or_name, force)
    }

    pub fn update_limits(&self, id_or_name: &str, limits: ResourceLimits) -> Result<Container> {
        self.inner.update_limits(id_or_name, limits)
    }

    pub fn inspect(&self, id_or_name: &str) -> Result<Container> {
        self.inner.resolve(id_or_name)
    }

    /// All containers, oldest first
    pub fn list(&self) -> Vec<Container> {
        self.inner.list()
    }

    pub fn stats(&self, id_or_name: &str) -> Result<ContainerStats> {
        let container = self.inner.resolve(id_or_name)?;
        Ok(ContainerStats {
            history: self.inner.collector.history(&container.id),
            id: container.id,
            name: container.name,
            state: container.state,
            latest: container.metrics_snapshot,
        })
    }

    /// Last `tail` lines of captured output, oldest first
    pub fn logs(&self, id_or_name: &str, tail: Option<usize>) -> Result<Vec<String>> {
        let container = self.inner.resolve(id_or_name)?;
        let tail = tail.unwrap_or(self.inner.config.log_tail_lines);
        read_tail(&self.inner.store.output_log_path(&container.id), tail)
    }

    pub fn export(&self, target: ExportTarget) -> Result<ExportBundle> {
        self.inner.refresh()?;
        let containers = match target {
            ExportTarget::One(id_or_name) => vec![self.inner.resolve(&id_or_name)?],
            ExportTarget::All => self.inner.list(),
        };
        ExportBundle::new(containers)
    }

    /// Insert all entries of `bundle`. Processes are never revived: live
    /// states are recorded as FAILED.
    pub fn import(&self, bundle: &ExportBundle) -> Result<Vec<Container>> {
        self.inner.import(bundle)
    }

    /// Reload the cache from the store
    pub fn refresh(&self) -> Result<()> {
        self.inner.refresh()
    }

    /// Stop the collector and pending restart timers and wait for them.
    /// Running containers are left running.
    pub fn shutdown(&self) {
        let sender = lock(&self.shutdown_tx).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        for handle in std::mem::take(&mut *lock(&self.threads)) {
            if handle.join().is_err() {
                warn!("Metrics thread panicked");
            }
        }
        loop {
            let handles = std::mem::take(&mut *lock(&self.inner.restart_threads));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    warn!("Restart thread panicked");
                }
            }
        }
        debug!("Engine background threads stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineInner {
    fn replace_cache(&self, registry: Registry) {
        let running = registry
            .containers
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .count();
        self.counters.running.set(running as u64);
        *write(&self.cache) = registry;
    }

    fn refresh(&self) -> Result<()> {
        let registry = self.store.load()?;
        self.replace_cache(registry);
        Ok(())
    }

    fn cached(&self, id_or_name: &str) -> Option<Container> {
        read(&self.cache).resolve(id_or_name).cloned()
    }

    /// Find a container by id or name, consulting the store on a cache miss
    fn resolve(&self, id_or_name: &str) -> Result<Container> {
        if let Some(container) = self.cached(id_or_name) {
            return Ok(container);
        }
        self.refresh()?;
        self.cached(id_or_name)
            .ok_or_else(|| EngineError::NotFound(id_or_name.to_string()))
    }

    fn list(&self) -> Vec<Container> {
        let mut containers: Vec<Container> =
            read(&self.cache).containers.values().cloned().collect();
        containers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        containers
    }

    fn guard(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(lock(&self.guards).entry(id.to_string()).or_default())
    }

    fn audit_container(&self, event_type: AuditEventType, container: &Container, details: String) {
        self.audit
            .record(AuditEvent::for_container(event_type, container, details));
    }

    fn teardown_cgroup(&self, id: &str) {
        if let Some(backend) = &self.cgroup {
            if let Err(e) = backend.remove(id) {
                warn!("Failed to remove cgroup of {}: {}", id, e);
            }
        }
    }

    fn recover(&self) -> Result<RecoveryReport> {
        let containers_dir = self.store.containers_dir();
        let (report, registry) = self.store.transact(|registry| {
            let mut report = recovery::reconcile(registry);
            for orphan in recovery::find_orphans(registry, &containers_dir) {
                match self.sandbox.remove_all(&orphan) {
                    Ok(()) => report.orphans.push(orphan),
                    Err(e) => warn!("Failed to remove orphaned {}: {}", orphan, e),
                }
            }
            Ok(report)
        })?;

        for id in &report.failed {
            self.teardown_cgroup(id);
            if let Some(container) = registry.containers.get(id) {
                self.audit_container(
                    AuditEventType::ContainerFailed,
                    container,
                    recovery::REASON_NOT_FOUND_ON_RECOVERY.to_string(),
                );
            }
        }
        for id in &report.resumed {
            if let Some(container) = registry.containers.get(id) {
                self.audit_container(
                    AuditEventType::StateRecovered,
                    container,
                    "interrupted transition settled as RUNNING".to_string(),
                );
            }
        }
        self.counters
            .recovered_entries
            .add((report.failed.len() + report.resumed.len() + report.repaired.len()) as u64);

        self.replace_cache(registry);
        Ok(report)
    }

    fn create(&self, spec: ContainerSpec) -> Result<Container> {
        validator::validate_spec(&spec)?;
        let container = Container::from_spec(spec);

        let (created, registry) = self.store.transact(|registry| {
            if registry.name_taken(&container.name) {
                return Err(EngineError::Validation(format!(
                    "name '{}' is already in use",
                    container.name
                )));
            }
            registry
                .containers
                .insert(container.id.clone(), container.clone());
            Ok(container.clone())
        })?;
        self.replace_cache(registry);

        self.counters.containers_created.inc();
        self.audit_container(
            AuditEventType::ContainerCreated,
            &created,
            format!(
                "image={} isolation={}",
                created.image.display(),
                created.isolation_level.as_str()
            ),
        );
        Ok(created)
    }

    fn start(&self, id_or_name: &str, cause: StartCause) -> Result<Container> {
        let id = self.resolve(id_or_name)?.id;
        let guard = self.guard(&id);
        let _held = lock(&guard);
        self.start_locked(&id, cause)
    }

    /// Prepare the sandbox and spawn. Errors are returned as the failure
    /// reason to record.
    fn launch(&self, container: &Container) -> std::result::Result<SpawnedProcess, String> {
        let layout = self
            .sandbox
            .prepare(container)
            .map_err(|e| format!("sandbox_failed: {}", error_detail(&e)))?;
        let confinement = layout
            .writable
            .as_deref()
            .map(WriteConfinement::prepare)
            .transpose()
            .map_err(|e| format!("sandbox_failed: {}", error_detail(&e)))?;

        let io_device = self.sandbox.io_device(&container.id);
        let plan = HardLimitPlan::prepare(
            &container.id,
            &container.resource_limits,
            &self.config,
            self.cgroup.as_deref(),
            io_device,
        )
        .map_err(|e| format!("spawn_failed: {}", error_detail(&e)))?;

        self.supervisor
            .spawn(container, &layout, &plan, confinement)
            .map_err(|e| {
                self.teardown_cgroup(&container.id);
                format!("spawn_failed: {}", error_detail(&e))
            })
    }

    fn start_locked(&self, id: &str, cause: StartCause) -> Result<Container> {
        let mut spawned_slot: Option<SpawnedProcess> = None;

        let result = self.store.transact(|registry| {
            let container = entry_mut(registry, id)?;
            if !container.state.can_start() {
                return Err(EngineError::invalid_state(container, "start"));
            }
            if cause == StartCause::Caller {
                container.restart_count = 0;
            }

            match self.launch(container) {
                Ok(spawned) => {
                    spawned_slot = Some(spawned);
                    container.attach_process(
                        ContainerState::Starting,
                        spawned.pid,
                        spawned.start_ticks,
                    );
                    container.transition_owner = Some(std::process::id());
                    container.started_at = Some(Utc::now());
                    container.metrics_snapshot = None;
                    Ok(None)
                }
                Err(reason) => {
                    container.detach_process(ContainerState::Failed, None, Some(reason.clone()));
                    Ok(Some(reason))
                }
            }
        });

        let (failure, registry) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(spawned) = spawned_slot {
                    error!(
                        "Could not persist start of {}, killing pid {}: {}",
                        id, spawned.pid, e
                    );
                    self.supervisor.kill(spawned.pid, spawned.start_ticks);
                    self.teardown_cgroup(id);
                }
                return Err(e);
            }
        };
        self.replace_cache(registry);

        if let Some(reason) = failure {
            self.counters.containers_failed.inc();
            if let Some(container) = self.cached(id) {
                self.audit_container(AuditEventType::StartFailed, &container, reason.clone());
            }
            self.maybe_schedule_restart(id);
            return Err(EngineError::Spawn(reason));
        }

        match spawned_slot {
            Some(spawned) => self.confirm_start(id, spawned),
            None => Err(EngineError::Spawn(format!(
                "spawn_failed: no process recorded for {}",
                id
            ))),
        }
    }

    /// Wait up to `start_confirm_ms` for an early exit, then settle STARTING
    fn confirm_start(&self, id: &str, spawned: SpawnedProcess) -> Result<Container> {
        // Two samples across the confirmation window make a violation
        // streak, so limits the process already exceeds fail the start
        let admission = self
            .cached(id)
            .filter(|container| container.isolation_level.soft_enforcement());
        if let Some(container) = &admission {
            self.collector.clear_violations(id);
            self.collector.check_limits(container);
        }

        let deadline = Instant::now() + self.config.start_confirm();
        let early_exit = loop {
            if let ProcessStatus::Exited(exit) = self.supervisor.poll(spawned.pid, spawned.start_ticks)
            {
                break Some(exit);
            }
            if Instant::now() >= deadline {
                break None;
            }
            thread::sleep(CONFIRM_POLL);
        };
        let violation = match early_exit {
            None => admission
                .as_ref()
                .and_then(|container| self.collector.check_limits(container)),
            Some(_) => None,
        };

        let (container, registry) = self.store.transact(|registry| {
            let container = entry_mut(registry, id)?;
            if container.state != ContainerState::Starting || container.pid != Some(spawned.pid) {
                return Ok(container.clone());
            }
            match early_exit {
                None => {
                    container.state = ContainerState::Running;
                    container.transition_owner = None;
                }
                Some(exit) => {
                    container.detach_process(
                        exit_state(exit),
                        exit.exit_code(),
                        exit.failure_reason(),
                    );
                }
            }
            Ok(container.clone())
        })?;
        self.replace_cache(registry);

        match early_exit {
            None => {
                self.counters.containers_started.inc();
                self.audit_container(
                    AuditEventType::ContainerStarted,
                    &container,
                    format!("pid {}", spawned.pid),
                );
                match violation {
                    None => Ok(container),
                    Some(detail) => {
                        self.counters.soft_limit_violations.inc();
                        self.audit_container(
                            AuditEventType::ResourceLimitViolation,
                            &container,
                            detail.clone(),
                        );
                        self.stop_locked(
                            id,
                            self.config.soft_stop_grace(),
                            Some(REASON_LIMIT_EXCEEDED),
                        )?;
                        Err(EngineError::ResourceLimitExceeded(detail))
                    }
                }
            }
            Some(exit) if exit.is_success() => {
                self.teardown_cgroup(id);
                self.counters.containers_stopped.inc();
                self.audit_container(
                    AuditEventType::ContainerExited,
                    &container,
                    "exited with code 0 during start".to_string(),
                );
                Ok(container)
            }
            Some(exit) => {
                self.teardown_cgroup(id);
                let reason = exit
                    .failure_reason()
                    .unwrap_or_else(|| "process_exited_unobserved".to_string());
                self.counters.containers_failed.inc();
                self.audit_container(AuditEventType::StartFailed, &container, reason.clone());
                self.maybe_schedule_restart(id);
                Err(EngineError::Spawn(format!(
                    "process exited during start: {}",
                    reason
                )))
            }
        }
    }

    fn stop(&self, id_or_name: &str, timeout: Option<Duration>) -> Result<Container> {
        let id = self.resolve(id_or_name)?.id;
        let guard = self.guard(&id);
        let _held = lock(&guard);
        let grace = timeout.unwrap_or_else(|| self.config.default_stop_timeout());
        self.stop_locked(&id, grace, None)
    }

    fn stop_locked(&self, id: &str, grace: Duration, reason: Option<&str>) -> Result<Container> {
        let ((pid, start_ticks), registry) = self.store.transact(|registry| {
            let container = entry_mut(registry, id)?;
            if container.state != ContainerState::Running {
                return Err(EngineError::invalid_state(container, "stop"));
            }
            let pid = container.pid.ok_or_else(|| {
                EngineError::Persistence(format!("{} is RUNNING without a pid", id))
            })?;
            container.state = ContainerState::Stopping;
            container.transition_owner = Some(std::process::id());
            Ok((pid, container.pid_start_ticks))
        })?;
        self.replace_cache(registry);

        let report = self.supervisor.terminate(pid, start_ticks, grace);
        // An exit that happened before the request is the process's own
        let unrequested = !report.signalled;

        let ((container, settled), registry) = self.store.transact(|registry| {
            let container = entry_mut(registry, id)?;
            let settled = container.pid == Some(pid) && container.state.has_live_process();
            if settled && unrequested {
                container.detach_process(
                    exit_state(report.exit),
                    report.exit.exit_code(),
                    report.exit.failure_reason(),
                );
            } else if settled {
                container.detach_process(
                    ContainerState::Stopped,
                    report.exit.exit_code(),
                    reason.map(str::to_string),
                );
            }
            Ok((container.clone(), settled))
        })?;
        self.replace_cache(registry);
        self.teardown_cgroup(id);
        self.collector.clear_violations(id);

        if unrequested {
            if settled {
                self.record_exit(&container);
            }
            return Err(EngineError::invalid_state(&container, "stop"));
        }

        if report.forced {
            self.counters.forced_kills.inc();
            self.audit_container(
                AuditEventType::ForcedKill,
                &container,
                format!("SIGKILL after {:?} grace", grace),
            );
        }
        self.counters.containers_stopped.inc();
        self.audit_container(
            AuditEventType::ContainerStopped,
            &container,
            format!(
                "exit_code={:?} reason={} after {:?}",
                container.exit_code,
                reason.unwrap_or("requested"),
                report.waited
            ),
        );
        Ok(container)
    }

    /// SIGKILL a container stuck in STARTING or STOPPING and record STOPPED
    fn kill_locked(&self, current: &Container) -> Result<()> {
        let exit = current
            .pid
            .map(|pid| self.supervisor.kill(pid, current.pid_start_ticks));

        let ((), registry) = self.store.transact(|registry| {
            let container = entry_mut(registry, &current.id)?;
            if container.state.has_live_process() {
                container.detach_process(
                    ContainerState::Stopped,
                    exit.and_then(|exit| exit.exit_code()),
                    None,
                );
            }
            Ok(())
        })?;
        self.replace_cache(registry);
        self.teardown_cgroup(&current.id);
        self.counters.forced_kills.inc();
        Ok(())
    }

    fn remove(&self, id_or_name: &str, force: bool) -> Result<Container> {
        let id = self.resolve(id_or_name)?.id;
        let guard = self.guard(&id);
        let _held = lock(&guard);

        let current = self
            .store
            .load()?
            .containers
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;

        if current.state.has_live_process() {
            if !force {
                return Err(EngineError::invalid_state(&current, "remove"));
            }
            if current.state == ContainerState::Running {
                // A process that already exited is settled as FAILED or
                // STOPPED, both of which can be removed
                match self.stop_locked(&id, self.config.default_stop_timeout(), None) {
                    Ok(_) | Err(EngineError::InvalidState { .. }) => {}
                    Err(e) => return Err(e),
                }
            } else {
                self.kill_locked(&current)?;
            }
        }

        let (removed, registry) = self.store.transact(|registry| {
            let container = registry
                .containers
                .get(&id)
                .ok_or_else(|| EngineError::NotFound(id.clone()))?;
            if !container.state.can_remove() {
                return Err(EngineError::invalid_state(container, "remove"));
            }
            let mut removed = container.clone();
            removed.state = ContainerState::Removed;
            registry.containers.remove(&id);
            Ok(removed)
        })?;
        self.replace_cache(registry);

        if let Err(e) = self.store.archive(&removed) {
            warn!("Could not archive removed container {}: {}", id, e);
        }

        if let Err(e) = self.sandbox.remove_all(&id) {
            self.audit_container(
                AuditEventType::CleanupFailure,
                &removed,
                format!("sandbox removal failed: {}", e),
            );
        }
        self.teardown_cgroup(&id);
        self.collector.forget(&id);
        lock(&self.guards).remove(&id);

        self.counters.containers_removed.inc();
        self.audit_container(
            AuditEventType::ContainerRemoved,
            &removed,
            format!("force={}", force),
        );
        Ok(removed)
    }

    fn update_limits(&self, id_or_name: &str, limits: ResourceLimits) -> Result<Container> {
        validator::validate_limits(&limits)?;
        let id = self.resolve(id_or_name)?.id;
        let guard = self.guard(&id);
        let _held = lock(&guard);

        let (container, registry) = self.store.transact(|registry| {
            let container = entry_mut(registry, &id)?;
            if !container.state.limits_mutable() {
                return Err(EngineError::invalid_state(container, "update limits of"));
            }
            if !container.isolation_level.allows_limit_relaxation()
                && container.resource_limits.relaxed_by(&limits)
            {
                return Err(EngineError::Validation(format!(
                    "{} isolation does not allow relaxing the limits of '{}'",
                    container.isolation_level.as_str(),
                    container.name
                )));
            }
            container.resource_limits = limits.clone();
            Ok(container.clone())
        })?;
        self.replace_cache(registry);

        self.audit_container(
            AuditEventType::LimitsUpdated,
            &container,
            format!("{:?}", container.resource_limits),
        );
        Ok(container)
    }

    fn import(&self, bundle: &ExportBundle) -> Result<Vec<Container>> {
        bundle.verify()?;
        for container in &bundle.containers {
            if container.state == ContainerState::Removed {
                return Err(EngineError::Validation(format!(
                    "bundle entry {} is REMOVED",
                    container.id
                )));
            }
            validator::validate_spec(&container.spec())?;
        }

        let (imported, registry) = self.store.transact(|registry| {
            let mut ids = HashSet::new();
            let mut names = HashSet::new();
            for container in &bundle.containers {
                if registry.containers.contains_key(&container.id) || !ids.insert(&container.id) {
                    return Err(EngineError::Validation(format!(
                        "container id {} already exists",
                        container.id
                    )));
                }
                if registry.name_taken(&container.name) || !names.insert(&container.name) {
                    return Err(EngineError::Validation(format!(
                        "name '{}' is already in use",
                        container.name
                    )));
                }
            }

            let mut imported = Vec::with_capacity(bundle.containers.len());
            for container in &bundle.containers {
                let mut container = container.clone();
                if container.state.has_live_process() {
                    container.detach_process(
                        ContainerState::Failed,
                        None,
                        Some(REASON_NOT_FOUND_ON_IMPORT.to_string()),
                    );
                } else {
                    container.pid = None;
                    container.pid_start_ticks = None;
                    container.transition_owner = None;
                }
                registry
                    .containers
                    .insert(container.id.clone(), container.clone());
                imported.push(container);
            }
            Ok(imported)
        })?;
        self.replace_cache(registry);

        for container in &imported {
            self.audit_container(
                AuditEventType::ContainerImported,
                container,
                format!("state={}", container.state),
            );
        }
        Ok(imported)
    }

    fn handle_unsolicited_exit(&self, id: &str) {
        let guard = self.guard(id);
        let _held = match guard.try_lock() {
            Ok(held) => held,
            Err(TryLockError::WouldBlock) => {
                debug!("{} is busy, exit will be handled next tick", id);
                return;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let current = match self.cached(id) {
            Some(container) if container.state == ContainerState::Running => container,
            _ => return,
        };
        let pid = match current.pid {
            Some(pid) => pid,
            None => return,
        };
        let exit = match self.supervisor.poll(pid, current.pid_start_ticks) {
            ProcessStatus::Running => return,
            ProcessStatus::Exited(exit) => exit,
        };
        // Children of the session leader outlive it
        signal::kill_stragglers(pid);

        let result = self.store.transact(|registry| {
            let container = entry_mut(registry, id)?;
            if container.state != ContainerState::Running || container.pid != Some(pid) {
                return Ok(None);
            }
            container.detach_process(exit_state(exit), exit.exit_code(), exit.failure_reason());
            Ok(Some(container.clone()))
        });

        match result {
            Ok((Some(container), registry)) => {
                self.replace_cache(registry);
                self.teardown_cgroup(id);
                self.collector.clear_violations(id);
                self.record_exit(&container);
            }
            Ok((None, registry)) => self.replace_cache(registry),
            Err(e) => error!("Failed to record exit of {}: {}", id, e),
        }
    }

    /// Count and audit an exit nobody asked for; failures consume the
    /// restart budget
    fn record_exit(&self, container: &Container) {
        if container.state == ContainerState::Failed {
            self.counters.containers_failed.inc();
            self.audit_container(
                AuditEventType::ContainerFailed,
                container,
                format!(
                    "{} (exit_code={:?})",
                    container.failure_reason.as_deref().unwrap_or("unknown"),
                    container.exit_code
                ),
            );
            self.maybe_schedule_restart(&container.id);
        } else {
            self.counters.containers_stopped.inc();
            self.audit_container(
                AuditEventType::ContainerExited,
                container,
                "exited with code 0".to_string(),
            );
        }
    }

    fn enforce_soft_limit(&self, id: &str, detail: &str) {
        let current = match self.cached(id) {
            Some(container) if container.state == ContainerState::Running => container,
            _ => return,
        };
        self.counters.soft_limit_violations.inc();
        self.audit_container(
            AuditEventType::ResourceLimitViolation,
            &current,
            detail.to_string(),
        );

        let guard = self.guard(id);
        let _held = lock(&guard);
        match self.stop_locked(id, self.config.soft_stop_grace(), Some(REASON_LIMIT_EXCEEDED)) {
            Ok(_) => info!("Stopped {} after soft limit violation", current.name),
            Err(EngineError::InvalidState { state, .. }) => {
                debug!("{} already left RUNNING ({})", id, state)
            }
            Err(e) => error!("Failed to stop {} over limit: {}", id, e),
        }
    }

    /// Consume one unit of the ON_FAILURE budget and start again after the
    /// configured backoff
    fn maybe_schedule_restart(&self, id: &str) {
        if matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Disconnected)) {
            return;
        }

        let budget = self.config.max_restart_attempts;
        let result = self.store.transact(|registry| {
            let container = entry_mut(registry, id)?;
            if container.restart_policy != RestartPolicy::OnFailure
                || container.state != ContainerState::Failed
                || container.restart_count >= budget
            {
                return Ok(None);
            }
            container.restart_count += 1;
            Ok(Some(container.clone()))
        });

        let container = match result {
            Ok((Some(container), registry)) => {
                self.replace_cache(registry);
                container
            }
            Ok((None, _)) => return,
            Err(e) => {
                warn!("Could not schedule restart of {}: {}", id, e);
                return;
            }
        };
        let inner = match self.me.upgrade() {
            Some(inner) => inner,
            None => return,
        };

        let backoff = self.config.restart_backoff();
        self.counters.restarts_scheduled.inc();
        self.audit_container(
            AuditEventType::RestartScheduled,
            &container,
            format!(
                "attempt {}/{} in {:?}",
                container.restart_count, budget, backoff
            ),
        );

        let shutdown = self.shutdown_rx.clone();
        let container_id = container.id.clone();
        let spawned = thread::Builder::new()
            .name("botbox-restart".to_string())
            .spawn(move || {
                if !matches!(shutdown.recv_timeout(backoff), Err(RecvTimeoutError::Timeout)) {
                    debug!("Restart of {} cancelled by shutdown", container_id);
                    return;
                }
                match inner.start(&container_id, StartCause::Restart) {
                    Ok(container) => info!("Restarted {} ({})", container.name, container.state),
                    Err(e) => warn!("Restart of {} failed: {}", container_id, e),
                }
            });

        match spawned {
            Ok(handle) => lock(&self.restart_threads).push(handle),
            Err(e) => error!("Failed to spawn restart timer: {}", e),
        }
    }
}

impl CollectorSink for EngineInner {
    fn running_containers(&self) -> Vec<Container> {
        read(&self.cache)
            .containers
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .cloned()
            .collect()
    }

    fn record_samples(&self, samples: Vec<(String, MetricsSnapshot)>) {
        self.counters.samples_taken.add(samples.len() as u64);
        let result = self.store.transact(|registry| {
            for (id, snapshot) in samples {
                if let Some(container) = registry.containers.get_mut(&id) {
                    if container.state == ContainerState::Running {
                        container.metrics_snapshot = Some(snapshot);
                    }
                }
            }
            Ok(())
        });
        match result {
            Ok(((), registry)) => self.replace_cache(registry),
            Err(e) => warn!("Failed to persist metrics samples: {}", e),
        }
    }

    fn process_exited(&self, container_id: &str) {
        self.handle_unsolicited_exit(container_id);
    }

    fn limit_exceeded(&self, container_id: &str, detail: &str) {
        self.enforce_soft_limit(container_id, detail);
    }
}

/// Last `n` lines of a file; invalid UTF-8 is replaced
fn read_tail(path: &Path, n: usize) -> Result<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut reader = BufReader::new(file);
    let mut lines = VecDeque::with_capacity(n);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if lines.len() == n {
            lines.pop_front();
        }
        lines.push_back(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(lines.into_iter().collect())
}
