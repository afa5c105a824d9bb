/// Engine configuration loading from a JSON file
use crate::config::types::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-wide settings. Durations are stored in milliseconds so the file
/// stays easy to edit by hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for the registry, audit logs and per-container directories
    pub storage_root: PathBuf,
    /// Parent cgroup (v2) under which per-container groups are created
    pub cgroup_root: PathBuf,
    /// Fail `start` instead of falling back to rlimits when cgroups are unusable
    pub require_cgroups: bool,
    pub enable_metrics: bool,
    pub metrics_interval_ms: u64,
    /// Rolling history length kept per container
    pub metrics_history: usize,
    pub default_stop_timeout_ms: u64,
    /// Grace period used when soft enforcement stops a container
    pub soft_stop_grace_ms: u64,
    /// Bounded wait after spawn before the process is considered running
    pub start_confirm_ms: u64,
    pub restart_backoff_ms: u64,
    pub max_restart_attempts: u32,
    pub lock_timeout_ms: u64,
    /// Extra room between the soft memory limit and the OS-enforced ceiling
    pub hard_memory_headroom_percent: u64,
    /// Lower bound for the RLIMIT_AS fallback
    pub rlimit_floor_mb: u64,
    pub log_tail_lines: usize,
}

impl EngineConfig {
    /// Default storage root scoped by effective UID so root and non-root
    /// engines never share a registry.
    pub fn default_storage_root() -> PathBuf {
        let euid = nix::unistd::geteuid();
        std::env::temp_dir().join(format!("botbox-uid-{}", euid))
    }

    pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
            EngineError::Validation(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable settings, warn about questionable ones
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.storage_root.as_os_str().is_empty() {
            errors.push("storage_root must not be empty".to_string());
        }
        if self.metrics_interval_ms == 0 {
            errors.push("metrics_interval_ms must be positive".to_string());
        }
        if self.metrics_history == 0 {
            errors.push("metrics_history must be at least 1".to_string());
        }
        if self.lock_timeout_ms == 0 {
            errors.push("lock_timeout_ms must be positive".to_string());
        }

        if self.metrics_interval_ms < 100 {
            log::warn!(
                "metrics_interval_ms={} is very short and will add sampling overhead",
                self.metrics_interval_ms
            );
        }
        if self.soft_stop_grace_ms > self.default_stop_timeout_ms {
            log::warn!(
                "soft_stop_grace_ms ({}) exceeds default_stop_timeout_ms ({})",
                self.soft_stop_grace_ms,
                self.default_stop_timeout_ms
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "Invalid engine config:\n{}",
                errors.join("\n")
            )))
        }
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn default_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.default_stop_timeout_ms)
    }

    pub fn soft_stop_grace(&self) -> Duration {
        Duration::from_millis(self.soft_stop_grace_ms)
    }

    pub fn start_confirm(&self) -> Duration {
        Duration::from_millis(self.start_confirm_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: Self::default_storage_root(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/botbox"),
            require_cgroups: false,
            enable_metrics: true,
            metrics_interval_ms: 1000,
            metrics_history: 120,
            default_stop_timeout_ms: 10_000,
            soft_stop_grace_ms: 2_000,
            start_confirm_ms: 150,
            restart_backoff_ms: 1_000,
            max_restart_attempts: 1,
            lock_timeout_ms: 5_000,
            hard_memory_headroom_percent: 25,
            rlimit_floor_mb: 64,
            log_tail_lines: 100,
        }
    }
}
