/// Core types and structures for the botbox engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a container
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Removed,
}

impl ContainerState {
    /// States in which a container owns a live OS process (and therefore a pid)
    pub fn has_live_process(self) -> bool {
        matches!(
            self,
            ContainerState::Starting | ContainerState::Running | ContainerState::Stopping
        )
    }

    /// States from which `start` is legal
    pub fn can_start(self) -> bool {
        matches!(
            self,
            ContainerState::Created | ContainerState::Stopped | ContainerState::Failed
        )
    }

    /// States from which `remove` is legal without force
    pub fn can_remove(self) -> bool {
        matches!(
            self,
            ContainerState::Created | ContainerState::Stopped | ContainerState::Failed
        )
    }

    /// States in which resource limits may be replaced
    pub fn limits_mutable(self) -> bool {
        self.can_remove()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Created => "CREATED",
            ContainerState::Starting => "STARTING",
            ContainerState::Running => "RUNNING",
            ContainerState::Stopping => "STOPPING",
            ContainerState::Stopped => "STOPPED",
            ContainerState::Failed => "FAILED",
            ContainerState::Removed => "REMOVED",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a container's working root is built
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxStrategy {
    /// Run the image in place against the host filesystem
    HostDirect,
    /// Private root with the image and volumes linked or copied in
    PrivateRoot,
    /// Private root made read-only except declared writable volumes
    ReadOnlyRoot,
}

/// Isolation policy bundle
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum IsolationLevel {
    /// Process isolation only. Fastest, least secure; meant for development.
    Minimal,
    #[default]
    Standard,
    Strict,
}

impl IsolationLevel {
    pub fn sandbox_strategy(self) -> SandboxStrategy {
        match self {
            IsolationLevel::Minimal => SandboxStrategy::HostDirect,
            IsolationLevel::Standard => SandboxStrategy::PrivateRoot,
            IsolationLevel::Strict => SandboxStrategy::ReadOnlyRoot,
        }
    }

    /// Whether sampled usage above a limit leads to an engine-driven stop
    pub fn soft_enforcement(self) -> bool {
        !matches!(self, IsolationLevel::Minimal)
    }

    pub fn allows_limit_relaxation(self) -> bool {
        !matches!(self, IsolationLevel::Strict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IsolationLevel::Minimal => "minimal",
            IsolationLevel::Standard => "standard",
            IsolationLevel::Strict => "strict",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(IsolationLevel::Minimal),
            "standard" => Ok(IsolationLevel::Standard),
            "strict" => Ok(IsolationLevel::Strict),
            other => Err(format!(
                "unknown isolation level '{}' (expected minimal, standard or strict)",
                other
            )),
        }
    }
}

/// What happens after a failed start or a crash
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "never" | "no" => Ok(RestartPolicy::Never),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            other => Err(format!(
                "unknown restart policy '{}' (expected never or on-failure)",
                other
            )),
        }
    }
}

/// Resource limits; `None` means unlimited
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// CPU share as a percentage of one core (200 = two cores)
    #[serde(default)]
    pub cpu_percent: Option<u32>,
    /// Ceiling on processes/threads in the container
    #[serde(default)]
    pub max_processes: Option<u32>,
    /// Block IO bandwidth in MiB/s, applied to reads and writes
    #[serde(default)]
    pub io_bandwidth: Option<u64>,
}

impl ResourceLimits {
    /// True if `next` removes or raises any limit present in `self`
    pub fn relaxed_by(&self, next: &ResourceLimits) -> bool {
        fn relaxes<T: PartialOrd + Copy>(current: Option<T>, next: Option<T>) -> bool {
            match (current, next) {
                (Some(_), None) => true,
                (Some(a), Some(b)) => b > a,
                (None, _) => false,
            }
        }

        relaxes(self.memory_mb, next.memory_mb)
            || relaxes(self.cpu_percent, next.cpu_percent)
            || relaxes(self.max_processes, next.max_processes)
            || relaxes(self.io_bandwidth, next.io_bandwidth)
    }
}

/// Volume binding from the host into a container root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeBinding {
    /// Parse `host:container[:ro|rw]`; a bare path binds to the same path
    pub fn parse(binding_str: &str) -> std::result::Result<Self, String> {
        let parts: Vec<&str> = binding_str.split(':').collect();
        let (host, container, options) = match parts.as_slice() {
            [host] => (*host, *host, ""),
            [host, container] => (*host, *container, ""),
            [host, container, options] => (*host, *container, *options),
            _ => {
                return Err(format!(
                    "Invalid volume '{}'. Use: host[:container[:ro|rw]]",
                    binding_str
                ))
            }
        };

        if host.is_empty() || container.is_empty() {
            return Err(format!("Volume '{}' has an empty path", binding_str));
        }

        let read_only = match options.trim() {
            "" | "rw" => false,
            "ro" => true,
            other => return Err(format!("Unknown volume option: {}", other)),
        };

        Ok(VolumeBinding {
            host_path: PathBuf::from(host),
            container_path: PathBuf::from(container),
            read_only,
        })
    }
}

/// Immutable request to create a container
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            args: Vec::new(),
            resource_limits: ResourceLimits::default(),
            isolation_level: IsolationLevel::default(),
            volumes: Vec::new(),
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_volume(mut self, volume: VolumeBinding) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}

/// Point-in-time resource usage of a container
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    /// Percent of one core over the last sampling interval
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub thread_count: u32,
    #[serde(default)]
    pub io_read_bytes: u64,
    #[serde(default)]
    pub io_write_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

/// The central entity, owned exclusively by the engine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub state: ContainerState,
    pub isolation_level: IsolationLevel,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Kernel start time of `pid`, guards against pid reuse
    #[serde(default)]
    pub pid_start_ticks: Option<u64>,
    /// Engine process driving an in-flight STARTING/STOPPING transition
    #[serde(default)]
    pub transition_owner: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics_snapshot: Option<MetricsSnapshot>,
}

impl Container {
    pub fn from_spec(spec: ContainerSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: spec.name,
            image: spec.image,
            args: spec.args,
            state: ContainerState::Created,
            isolation_level: spec.isolation_level,
            resource_limits: spec.resource_limits,
            volumes: spec.volumes,
            env: spec.env,
            restart_policy: spec.restart_policy,
            pid: None,
            pid_start_ticks: None,
            transition_owner: None,
            exit_code: None,
            failure_reason: None,
            restart_count: 0,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            metrics_snapshot: None,
        }
    }

    /// The creation request this entry corresponds to
    pub fn spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            args: self.args.clone(),
            resource_limits: self.resource_limits.clone(),
            isolation_level: self.isolation_level,
            volumes: self.volumes.clone(),
            env: self.env.clone(),
            restart_policy: self.restart_policy,
        }
    }

    /// `pid` is set iff the state implies a live process
    pub fn pid_invariant_holds(&self) -> bool {
        self.pid.is_some() == self.state.has_live_process()
    }

    /// Record a spawned process and enter a live state
    pub fn attach_process(&mut self, state: ContainerState, pid: u32, start_ticks: Option<u64>) {
        debug_assert!(state.has_live_process());
        self.state = state;
        self.pid = Some(pid);
        self.pid_start_ticks = start_ticks;
        self.exit_code = None;
        self.failure_reason = None;
        self.stopped_at = None;
    }

    /// Leave a live state, dropping the process association
    pub fn detach_process(
        &mut self,
        state: ContainerState,
        exit_code: Option<i32>,
        failure_reason: Option<String>,
    ) {
        debug_assert!(!state.has_live_process());
        self.state = state;
        self.pid = None;
        self.pid_start_ticks = None;
        self.transition_owner = None;
        self.exit_code = exit_code;
        self.failure_reason = failure_reason;
        self.stopped_at = Some(Utc::now());
    }
}

/// Custom error types for botbox
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Cannot {operation} container {id} in state {state}")]
    InvalidState {
        id: String,
        state: ContainerState,
        operation: &'static str,
    },

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_NOT_FOUND: i32 = 2;
pub const EXIT_INVALID_STATE: i32 = 3;
pub const EXIT_VALIDATION: i32 = 4;
pub const EXIT_SPAWN: i32 = 5;
pub const EXIT_RESOURCE_LIMIT: i32 = 6;
pub const EXIT_INTERNAL: i32 = 10;

impl EngineError {
    pub fn invalid_state(container: &Container, operation: &'static str) -> Self {
        EngineError::InvalidState {
            id: container.id.clone(),
            state: container.state,
            operation,
        }
    }

    /// CLI exit code for this failure class
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Validation(_) => EXIT_VALIDATION,
            EngineError::NotFound(_) => EXIT_NOT_FOUND,
            EngineError::InvalidState { .. } => EXIT_INVALID_STATE,
            EngineError::Spawn(_) => EXIT_SPAWN,
            EngineError::ResourceLimitExceeded(_) => EXIT_RESOURCE_LIMIT,
            EngineError::Persistence(_) | EngineError::Lock(_) | EngineError::Io(_) => {
                EXIT_INTERNAL
            }
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<nix::errno::Errno> for EngineError {
    fn from(err: nix::errno::Errno) -> Self {
        EngineError::Io(std::io::Error::from(err))
    }
}

/// Result type alias for botbox operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_states_match_pid_invariant() {
        let mut container = Container::from_spec(ContainerSpec::new("bot", "/bin/true"));
        assert!(container.pid_invariant_holds());

        container.attach_process(ContainerState::Running, 4242, Some(1));
        assert!(container.pid_invariant_holds());
        assert_eq!(container.pid, Some(4242));

        container.detach_process(ContainerState::Failed, Some(137), Some("killed".into()));
        assert!(container.pid_invariant_holds());
        assert!(container.stopped_at.is_some());
        assert!(container.transition_owner.is_none());
    }

    #[test]
    fn test_volume_parse() {
        let rw = VolumeBinding::parse("/srv/data:/data").unwrap();
        assert!(!rw.read_only);
        assert_eq!(rw.container_path, PathBuf::from("/data"));

        let ro = VolumeBinding::parse("/etc/bot:/config:ro").unwrap();
        assert!(ro.read_only);

        let same = VolumeBinding::parse("/shared").unwrap();
        assert_eq!(same.host_path, same.container_path);

        assert!(VolumeBinding::parse("/a:/b:noexec").is_err());
        assert!(VolumeBinding::parse(":/b").is_err());
    }

    #[test]
    fn test_limit_relaxation() {
        let current = ResourceLimits {
            memory_mb: Some(256),
            cpu_percent: Some(50),
            ..Default::default()
        };

        let tighter = ResourceLimits {
            memory_mb: Some(128),
            cpu_percent: Some(50),
            max_processes: Some(4),
            ..Default::default()
        };
        assert!(!current.relaxed_by(&tighter));

        let raised = ResourceLimits {
            memory_mb: Some(512),
            ..current.clone()
        };
        assert!(current.relaxed_by(&raised));

        let dropped = ResourceLimits {
            cpu_percent: None,
            ..current.clone()
        };
        assert!(current.relaxed_by(&dropped));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&ContainerState::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
        let policy = serde_json::to_string(&RestartPolicy::OnFailure).unwrap();
        assert_eq!(policy, "\"ON_FAILURE\"");
    }

    #[test]
    fn test_isolation_strategy() {
        assert_eq!(
            IsolationLevel::Minimal.sandbox_strategy(),
            SandboxStrategy::HostDirect
        );
        assert!(!IsolationLevel::Minimal.soft_enforcement());
        assert!(IsolationLevel::Standard.soft_enforcement());
        assert!(!IsolationLevel::Strict.allows_limit_relaxation());
        assert_eq!("STRICT".parse::<IsolationLevel>(), Ok(IsolationLevel::Strict));
        assert_eq!("on_failure".parse::<RestartPolicy>(), Ok(RestartPolicy::OnFailure));
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let container = Container::from_spec(ContainerSpec::new("bot", "/bin/true"));
        let codes = [
            EngineError::NotFound("x".into()).exit_code(),
            EngineError::invalid_state(&container, "stop").exit_code(),
            EngineError::Persistence("x".into()).exit_code(),
        ];
        assert_eq!(codes, [EXIT_NOT_FOUND, EXIT_INVALID_STATE, EXIT_INTERNAL]);
    }
}
