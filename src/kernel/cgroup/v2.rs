/// Cgroup v2 backend implementation
/// One child group per container under the configured root.
use crate::config::types::{EngineError, Result};
use crate::kernel::cgroup::backend::{CgroupBackend, CgroupLimits, CgroupUsage, CPU_PERIOD_USEC};
use nix::unistd::{access, AccessFlags};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const CONTROLLERS: [&str; 4] = ["memory", "pids", "cpu", "io"];

/// Cgroup v2 backend
pub struct CgroupV2 {
    base_path: PathBuf,
}

impl CgroupV2 {
    /// Open (creating if needed) the engine's parent group and delegate the
    /// controllers it needs to container groups.
    pub fn open(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path).map_err(|e| {
            EngineError::Spawn(format!(
                "Failed to create cgroup root {}: {}",
                base_path.display(),
                e
            ))
        })?;

        if !base_path.join("cgroup.controllers").exists() {
            return Err(EngineError::Spawn(format!(
                "{} is not a cgroup v2 directory",
                base_path.display()
            )));
        }
        access(&base_path.join("cgroup.procs"), AccessFlags::W_OK).map_err(|e| {
            EngineError::Spawn(format!(
                "cgroup root {} is not writable: {}",
                base_path.display(),
                e
            ))
        })?;

        let backend = CgroupV2 {
            base_path: base_path.to_path_buf(),
        };
        backend.enable_controllers();
        Ok(backend)
    }

    fn enable_controllers(&self) {
        let available = fs::read_to_string(self.base_path.join("cgroup.controllers"))
            .unwrap_or_default();
        let control = self.base_path.join("cgroup.subtree_control");

        for controller in CONTROLLERS {
            if !available.split_whitespace().any(|c| c == controller) {
                log::warn!("cgroup controller '{}' not delegated to botbox", controller);
                continue;
            }
            if let Err(e) = fs::write(&control, format!("+{}", controller)) {
                log::warn!("Failed to enable cgroup controller '{}': {}", controller, e);
            }
        }
    }

    /// Get cgroup path for a container
    fn container_path(&self, container_id: &str) -> PathBuf {
        self.base_path.join(container_id)
    }

    fn write_control(&self, container_id: &str, file: &str, value: &str) -> Result<()> {
        let path = self.container_path(container_id).join(file);
        if !path.exists() {
            log::warn!(
                "{} missing for container {}, controller not enabled",
                file,
                container_id
            );
            return Ok(());
        }
        fs::write(&path, value)
            .map_err(|e| EngineError::Spawn(format!("Failed to set {}={}: {}", file, value, e)))
    }

    fn read_u64(&self, container_id: &str, file: &str) -> Option<u64> {
        fs::read_to_string(self.container_path(container_id).join(file))
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    /// Read a `key value` line from a flat-keyed file such as cpu.stat
    fn read_keyed(&self, container_id: &str, file: &str, key: &str) -> Option<u64> {
        let content = fs::read_to_string(self.container_path(container_id).join(file)).ok()?;
        parse_keyed(&content, key)
    }
}

fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, container_id: &str) -> Result<()> {
        let path = self.container_path(container_id);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(EngineError::Spawn(format!(
                    "Failed to create cgroup {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        // Kill the whole group on OOM rather than a single task
        let oom_group = path.join("memory.oom.group");
        if oom_group.exists() {
            if let Err(e) = fs::write(&oom_group, "1") {
                log::warn!("Failed to set memory.oom.group: {}", e);
            }
        }
        Ok(())
    }

    fn remove(&self, container_id: &str) -> Result<()> {
        match fs::remove_dir(self.container_path(container_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    fn apply_limits(&self, container_id: &str, limits: &CgroupLimits) -> Result<()> {
        let max_or = |value: Option<u64>| value.map_or("max".to_string(), |v| v.to_string());

        self.write_control(container_id, "memory.max", &max_or(limits.memory_max_bytes))?;
        self.write_control(container_id, "memory.high", &max_or(limits.memory_high_bytes))?;
        self.write_control(
            container_id,
            "pids.max",
            &max_or(limits.pids_max.map(u64::from)),
        )?;
        self.write_control(
            container_id,
            "cpu.max",
            &format!("{} {}", max_or(limits.cpu_quota_usec), CPU_PERIOD_USEC),
        )?;

        // io.max only accepts block devices; tmpfs and overlay roots have none
        if let (Some(bps), Some((major, minor))) = (limits.io_bps, limits.io_device) {
            let value = format!("{}:{} rbps={} wbps={}", major, minor, bps, bps);
            if let Err(e) = self.write_control(container_id, "io.max", &value) {
                log::warn!("IO bandwidth limit not applied for {}: {}", container_id, e);
            }
        }
        Ok(())
    }

    fn procs_path(&self, container_id: &str) -> PathBuf {
        self.container_path(container_id).join("cgroup.procs")
    }

    fn usage(&self, container_id: &str) -> Result<CgroupUsage> {
        Ok(CgroupUsage {
            memory_bytes: self.read_u64(container_id, "memory.current"),
            cpu_usage_usec: self.read_keyed(container_id, "cpu.stat", "usage_usec"),
            pids: self
                .read_u64(container_id, "pids.current")
                .map(|v| v as u32),
            oom_kills: self.read_keyed(container_id, "memory.events", "oom_kill"),
        })
    }

    fn exists(&self, container_id: &str) -> bool {
        self.container_path(container_id).is_dir()
    }
}
