//! Cgroup backend abstraction.

use crate::config::types::Result;
use std::path::{Path, PathBuf};

/// Usage counters read from a container's cgroup. Fields the kernel does
/// not expose stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    pub memory_bytes: Option<u64>,
    pub cpu_usage_usec: Option<u64>,
    pub pids: Option<u32>,
    pub oom_kills: Option<u64>,
}

/// Concrete per-container limit values, already converted to kernel units
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupLimits {
    /// memory.max
    pub memory_max_bytes: Option<u64>,
    /// memory.high
    pub memory_high_bytes: Option<u64>,
    pub pids_max: Option<u32>,
    /// cpu.max quota over `CPU_PERIOD_USEC`
    pub cpu_quota_usec: Option<u64>,
    /// io.max rbps/wbps on `io_device`
    pub io_bps: Option<u64>,
    pub io_device: Option<(u64, u64)>,
}

pub const CPU_PERIOD_USEC: u64 = 100_000;

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    fn create(&self, container_id: &str) -> Result<()>;
    fn remove(&self, container_id: &str) -> Result<()>;
    fn apply_limits(&self, container_id: &str, limits: &CgroupLimits) -> Result<()>;
    /// `cgroup.procs` of the container group, written by the child itself
    fn procs_path(&self, container_id: &str) -> PathBuf;
    fn usage(&self, container_id: &str) -> Result<CgroupUsage>;
    fn exists(&self, container_id: &str) -> bool;
}

/// Probe `root` for a usable cgroup v2 hierarchy. The root is created when
/// missing; an unwritable or v1-only host yields `None`.
pub fn detect_cgroup_backend(root: &Path) -> Option<Box<dyn CgroupBackend>> {
    if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        log::info!("cgroup v2 unified hierarchy not present, using rlimit fallback");
        return None;
    }

    match crate::kernel::cgroup::v2::CgroupV2::open(root) {
        Ok(backend) => {
            log::info!("Using cgroup v2 backend at {}", root.display());
            Some(Box::new(backend))
        }
        Err(e) => {
            log::info!(
                "cgroup root {} unusable ({}), using rlimit fallback",
                root.display(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_never_panics() {
        let dir = tempfile::tempdir().unwrap();
        // A tmpfs directory is never a cgroup hierarchy
        let _backend = detect_cgroup_backend(&dir.path().join("botbox"));
    }
}
