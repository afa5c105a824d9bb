//! Process supervisor: spawns container processes and observes their exit.
//!
//! Processes spawned by this engine instance are kept as owned [`Child`]
//! handles so their exact wait status is available. Processes inherited
//! from another engine process (after recovery or from a CLI invocation)
//! can only be observed through `/proc`; their exit status is unknown.

use crate::config::types::{Container, EngineError, Result};
use crate::kernel::confinement::WriteConfinement;
use crate::kernel::{procfs, signal};
use crate::runtime::limits::HardLimitPlan;
use crate::runtime::sandbox::SandboxLayout;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Bound on waiting for a SIGKILLed process to disappear
const KILL_WAIT: Duration = Duration::from_secs(5);
const ETXTBSY_RETRIES: u32 = 5;
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub start_ticks: Option<u64>,
}

/// How a process ended, as far as it could be observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    Code(i32),
    Signal(i32),
    /// The process vanished without a wait status we could collect
    Unobserved,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitInfo::Code(code),
            (None, Some(sig)) => ExitInfo::Signal(sig),
            (None, None) => ExitInfo::Unobserved,
        }
    }

    pub fn exit_code(self) -> Option<i32> {
        match self {
            ExitInfo::Code(code) => Some(code),
            ExitInfo::Signal(sig) => Some(signal::signal_exit_code(sig)),
            ExitInfo::Unobserved => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitInfo::Code(0)
    }

    /// Stable failure reason for a non-zero or unobservable exit
    pub fn failure_reason(self) -> Option<String> {
        match self {
            ExitInfo::Code(0) => None,
            ExitInfo::Code(code) => Some(format!("exited_with_code_{}", code)),
            ExitInfo::Signal(sig) => Some(format!("killed_by_signal_{}", sig)),
            ExitInfo::Unobserved => Some("process_exited_unobserved".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(ExitInfo),
}

/// Result of a graceful stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationReport {
    pub exit: ExitInfo,
    /// SIGKILL was needed after the grace period
    pub forced: bool,
    /// False when the leader had already exited before SIGTERM was sent
    pub signalled: bool,
    pub waited: Duration,
}

#[derive(Default)]
pub struct ProcessSupervisor {
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the container's process as a new session leader with stdout
    /// and stderr appended to the container's output log. `confinement` is
    /// enforced last, after the limits.
    pub fn spawn(
        &self,
        container: &Container,
        layout: &SandboxLayout,
        plan: &HardLimitPlan,
        confinement: Option<WriteConfinement>,
    ) -> Result<SpawnedProcess> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&layout.log_path)
            .map_err(|e| {
                EngineError::Spawn(format!(
                    "cannot open output log {}: {}",
                    layout.log_path.display(),
                    e
                ))
            })?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&layout.program);
        cmd.args(&container.args)
            .current_dir(&layout.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            );
        if let Ok(lang) = std::env::var("LANG") {
            cmd.env("LANG", lang);
        }
        cmd.envs(layout.env.iter().map(|(k, v)| (k, v)));
        cmd.envs(&container.env);

        let plan = plan.clone();
        // Taken in the child, so every retried fork still gets its own copy
        let mut confinement = confinement;
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                plan.apply_in_child()?;
                match confinement.take() {
                    Some(confinement) => confinement.enforce(),
                    None => Ok(()),
                }
            });
        }

        // A concurrent fork can briefly hold the freshly copied image open
        // for writing
        let mut attempt = 0;
        let child = loop {
            match cmd.spawn() {
                Ok(child) => break child,
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < ETXTBSY_RETRIES => {
                    attempt += 1;
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(EngineError::Spawn(format!(
                        "{}: {}",
                        layout.program.display(),
                        e
                    )))
                }
            }
        };
        let pid = child.id();
        let start_ticks = procfs::read_stat(pid).map(|stat| stat.start_ticks);

        self.lock_children().insert(pid, child);
        log::debug!("Spawned {} for {} (pid {})", layout.program.display(), container.id, pid);

        Ok(SpawnedProcess { pid, start_ticks })
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        // A panic while holding the map cannot leave it inconsistent
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Non-blocking status check
    pub fn poll(&self, pid: u32, start_ticks: Option<u64>) -> ProcessStatus {
        {
            let mut children = self.lock_children();
            if let Some(child) = children.get_mut(&pid) {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        children.remove(&pid);
                        return ProcessStatus::Exited(ExitInfo::from_status(status));
                    }
                    Ok(None) => return ProcessStatus::Running,
                    Err(e) => {
                        log::warn!("wait on pid {} failed: {}", pid, e);
                        children.remove(&pid);
                    }
                }
            }
        }

        if procfs::process_alive(pid, start_ticks) {
            ProcessStatus::Running
        } else {
            ProcessStatus::Exited(ExitInfo::Unobserved)
        }
    }

    /// Whether this supervisor holds the wait handle for `pid`
    pub fn owns(&self, pid: u32) -> bool {
        self.lock_children().contains_key(&pid)
    }

    fn wait_for_exit(&self, pid: u32, start_ticks: Option<u64>, limit: Duration) -> Option<ExitInfo> {
        let deadline = Instant::now() + limit;
        loop {
            if let ProcessStatus::Exited(exit) = self.poll(pid, start_ticks) {
                return Some(exit);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGTERM the process group, escalate to SIGKILL after `grace`
    pub fn terminate(&self, pid: u32, start_ticks: Option<u64>, grace: Duration) -> TerminationReport {
        let started = Instant::now();

        if let ProcessStatus::Exited(exit) = self.poll(pid, start_ticks) {
            signal::kill_stragglers(pid);
            return TerminationReport {
                exit,
                forced: false,
                signalled: false,
                waited: started.elapsed(),
            };
        }

        if let Err(e) = signal::signal_group(pid, Signal::SIGTERM) {
            log::warn!("SIGTERM to process group {} failed: {}", pid, e);
        }

        if let Some(exit) = self.wait_for_exit(pid, start_ticks, grace) {
            signal::kill_stragglers(pid);
            return TerminationReport {
                exit,
                forced: false,
                signalled: true,
                waited: started.elapsed(),
            };
        }

        log::warn!("pid {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
        let exit = self.kill(pid, start_ticks);
        TerminationReport {
            exit,
            forced: true,
            signalled: true,
            waited: started.elapsed(),
        }
    }

    /// SIGKILL the process group and wait for the leader to go away
    pub fn kill(&self, pid: u32, start_ticks: Option<u64>) -> ExitInfo {
        if let ProcessStatus::Exited(exit) = self.poll(pid, start_ticks) {
            signal::kill_stragglers(pid);
            return exit;
        }

        signal::kill_group(pid);
        match self.wait_for_exit(pid, start_ticks, KILL_WAIT) {
            Some(exit) => {
                signal::kill_stragglers(pid);
                exit
            }
            None => {
                log::error!("pid {} survived SIGKILL for {:?}", pid, KILL_WAIT);
                ExitInfo::Unobserved
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::engine::EngineConfig;
    use crate::config::types::{ContainerSpec, IsolationLevel, ResourceLimits};
    use crate::runtime::sandbox::FilesystemSandbox;

    fn launch(script: &str) -> (tempfile::TempDir, ProcessSupervisor, Container, SpawnedProcess) {
        let work = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_storage_root(work.path());
        let sandbox = FilesystemSandbox::new(work.path());
        let container = Container::from_spec(
            ContainerSpec::new("bot", "/bin/sh")
                .with_isolation(IsolationLevel::Minimal)
                .with_args(vec!["-c".to_string(), script.to_string()]),
        );

        let layout = sandbox.prepare(&container).unwrap();
        let plan =
            HardLimitPlan::prepare(&container.id, &ResourceLimits::default(), &config, None, None)
                .unwrap();
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor.spawn(&container, &layout, &plan, None).unwrap();
        (work, supervisor, container, spawned)
    }

    #[test]
    fn test_exit_code_is_observed() {
        let (_work, supervisor, _container, spawned) = launch("exit 3");
        let exit = supervisor
            .wait_for_exit(spawned.pid, spawned.start_ticks, Duration::from_secs(5))
            .unwrap();
        assert_eq!(exit, ExitInfo::Code(3));
        assert_eq!(exit.failure_reason().as_deref(), Some("exited_with_code_3"));
        assert!(!supervisor.owns(spawned.pid));
    }

    #[test]
    fn test_output_goes_to_log() {
        let (work, supervisor, container, spawned) = launch("echo out; echo err >&2");
        supervisor
            .wait_for_exit(spawned.pid, spawned.start_ticks, Duration::from_secs(5))
            .unwrap();
        let log = std::fs::read_to_string(work.path().join(&container.id).join("output.log"))
            .unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }

    #[test]
    fn test_terminate_graceful_and_forced() {
        let (_work, supervisor, _c, spawned) = launch("sleep 30");
        assert_eq!(
            supervisor.poll(spawned.pid, spawned.start_ticks),
            ProcessStatus::Running
        );
        let report = supervisor.terminate(spawned.pid, spawned.start_ticks, Duration::from_secs(5));
        assert!(!report.forced);
        assert!(report.signalled);
        assert_eq!(report.exit, ExitInfo::Signal(libc::SIGTERM));
        assert_eq!(report.exit.exit_code(), Some(143));

        let (_work, supervisor, _c, spawned) = launch("trap '' TERM; while :; do sleep 1; done");
        thread::sleep(Duration::from_millis(100));
        let report =
            supervisor.terminate(spawned.pid, spawned.start_ticks, Duration::from_millis(200));
        assert!(report.forced);
        assert_eq!(report.exit, ExitInfo::Signal(libc::SIGKILL));
        assert!(!procfs::process_alive(spawned.pid, spawned.start_ticks));
    }

    #[test]
    fn test_terminate_after_exit_does_not_signal() {
        let (_work, supervisor, _c, spawned) = launch("exit 3");
        thread::sleep(Duration::from_millis(200));
        let report = supervisor.terminate(spawned.pid, spawned.start_ticks, Duration::from_secs(1));
        assert!(!report.signalled);
        assert!(!report.forced);
        assert_eq!(report.exit, ExitInfo::Code(3));
    }

    #[test]
    fn test_unowned_process_is_observed_through_proc() {
        let (_work, supervisor, _c, spawned) = launch("sleep 30");
        let stranger = ProcessSupervisor::new();
        assert_eq!(
            stranger.poll(spawned.pid, spawned.start_ticks),
            ProcessStatus::Running
        );
        // A wrong start time means a different process
        assert_eq!(
            stranger.poll(spawned.pid, spawned.start_ticks.map(|t| t + 1)),
            ProcessStatus::Exited(ExitInfo::Unobserved)
        );
        supervisor.kill(spawned.pid, spawned.start_ticks);
    }
}
