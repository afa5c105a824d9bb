//! Resource enforcement.
//!
//! [`HardLimitPlan`] is computed in the parent before spawn and applied by
//! the child in `pre_exec`; [`SoftLimitTracker`] turns sampled usage into
//! violation decisions for the enforcement thread.

use crate::config::engine::EngineConfig;
use crate::config::types::{EngineError, MetricsSnapshot, ResourceLimits, Result};
use crate::kernel::cgroup::backend::{CgroupBackend, CgroupLimits, CPU_PERIOD_USEC};
use crate::kernel::rlimit;
use nix::sys::resource::Resource;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::sync::Mutex;

const MIB: u64 = 1024 * 1024;

/// Limits the child applies to itself between fork and exec
#[derive(Debug, Clone)]
pub struct HardLimitPlan {
    /// `cgroup.procs` of the container's group, when one was prepared
    cgroup_procs: Option<CString>,
    rlimits: Vec<(Resource, u64)>,
    nice: Option<i32>,
}

impl HardLimitPlan {
    /// Build the plan and prepare the container's cgroup. Without a usable
    /// cgroup the plan falls back to RLIMIT_AS, RLIMIT_NPROC and niceness,
    /// unless the configuration requires cgroups.
    pub fn prepare(
        container_id: &str,
        limits: &ResourceLimits,
        config: &EngineConfig,
        cgroup: Option<&dyn CgroupBackend>,
        io_device: Option<(u64, u64)>,
    ) -> Result<Self> {
        let mut plan = HardLimitPlan {
            cgroup_procs: None,
            rlimits: vec![(Resource::RLIMIT_CORE, 0)],
            nice: None,
        };

        if let Some(backend) = cgroup {
            match Self::prepare_cgroup(container_id, limits, config, backend, io_device) {
                Ok(procs) => plan.cgroup_procs = Some(procs),
                Err(e) if config.require_cgroups => return Err(e),
                Err(e) => log::warn!(
                    "cgroup setup failed for {}, falling back to rlimits: {}",
                    container_id,
                    e
                ),
            }
        } else if config.require_cgroups {
            return Err(EngineError::Spawn(
                "cgroups are required but no usable cgroup v2 hierarchy was found".to_string(),
            ));
        }

        if plan.cgroup_procs.is_none() {
            if let Some(mb) = limits.memory_mb {
                plan.rlimits
                    .push((Resource::RLIMIT_AS, hard_memory_bytes(mb, config)));
            }
            // Counted per uid, not per container
            if let Some(max) = limits.max_processes {
                plan.rlimits.push((Resource::RLIMIT_NPROC, u64::from(max)));
            }
            if let Some(cpu) = limits.cpu_percent {
                plan.nice = Some(rlimit::nice_for_cpu_percent(cpu)).filter(|n| *n > 0);
            }
        }

        Ok(plan)
    }

    fn prepare_cgroup(
        container_id: &str,
        limits: &ResourceLimits,
        config: &EngineConfig,
        backend: &dyn CgroupBackend,
        io_device: Option<(u64, u64)>,
    ) -> Result<CString> {
        backend.create(container_id)?;
        backend.apply_limits(container_id, &cgroup_limits(limits, config, io_device))?;

        let procs = backend.procs_path(container_id);
        CString::new(procs.as_os_str().as_bytes())
            .map_err(|_| EngineError::Spawn(format!("invalid cgroup path {}", procs.display())))
    }

    pub fn uses_cgroup(&self) -> bool {
        self.cgroup_procs.is_some()
    }

    /// Apply the plan to the calling process. Runs in the forked child,
    /// so only async-signal-safe calls are made.
    pub fn apply_in_child(&self) -> std::io::Result<()> {
        if let Some(procs) = &self.cgroup_procs {
            rlimit::attach_self_to_cgroup(procs)?;
        }
        for (resource, value) in &self.rlimits {
            rlimit::set_rlimit(*resource, *value)?;
        }
        if let Some(nice) = self.nice {
            rlimit::set_nice(nice)?;
        }
        Ok(())
    }
}

/// OS-enforced memory ceiling: the configured limit plus headroom, never
/// below the configured floor
pub fn hard_memory_bytes(memory_mb: u64, config: &EngineConfig) -> u64 {
    let with_headroom = memory_mb
        .saturating_mul(MIB)
        .saturating_mul(100 + config.hard_memory_headroom_percent)
        / 100;
    with_headroom.max(config.rlimit_floor_mb.saturating_mul(MIB))
}

/// Convert user-facing limits into cgroup v2 values
pub fn cgroup_limits(
    limits: &ResourceLimits,
    config: &EngineConfig,
    io_device: Option<(u64, u64)>,
) -> CgroupLimits {
    let floor = config.rlimit_floor_mb.saturating_mul(MIB);
    CgroupLimits {
        memory_max_bytes: limits.memory_mb.map(|mb| hard_memory_bytes(mb, config)),
        memory_high_bytes: limits
            .memory_mb
            .map(|mb| mb.saturating_mul(MIB).max(floor)),
        pids_max: limits.max_processes,
        // cpu.max rejects quotas below 1ms
        cpu_quota_usec: limits
            .cpu_percent
            .map(|pct| (u64::from(pct) * CPU_PERIOD_USEC / 100).max(1_000)),
        io_bps: limits.io_bandwidth.map(|mbps| mbps.saturating_mul(MIB)),
        io_device,
    }
}

/// Which limit a sample exceeded
pub fn exceeded_limit(limits: &ResourceLimits, sample: &MetricsSnapshot) -> Option<String> {
    if let Some(mb) = limits.memory_mb {
        if sample.memory_mb > mb as f64 {
            return Some(format!(
                "memory {:.1} MB exceeds limit {} MB",
                sample.memory_mb, mb
            ));
        }
    }
    if let Some(cpu) = limits.cpu_percent {
        if sample.cpu_percent > f64::from(cpu) {
            return Some(format!(
                "cpu {:.1}% exceeds limit {}%",
                sample.cpu_percent, cpu
            ));
        }
    }
    if let Some(max) = limits.max_processes {
        if sample.thread_count > max {
            return Some(format!(
                "{} tasks exceed limit {}",
                sample.thread_count, max
            ));
        }
    }
    None
}

/// Consecutive-violation streaks per container
#[derive(Debug, Default)]
pub struct SoftLimitTracker {
    streaks: Mutex<HashMap<String, u32>>,
}

impl SoftLimitTracker {
    /// Record a sample. Returns the violation detail once a limit has been
    /// exceeded for more than one consecutive interval.
    pub fn observe(
        &self,
        container_id: &str,
        limits: &ResourceLimits,
        sample: &MetricsSnapshot,
    ) -> Option<String> {
        let mut streaks = self.streaks.lock().ok()?;
        match exceeded_limit(limits, sample) {
            Some(detail) => {
                let streak = streaks.entry(container_id.to_string()).or_insert(0);
                *streak += 1;
                if *streak > 1 {
                    Some(detail)
                } else {
                    log::debug!("{} over limit once: {}", container_id, detail);
                    None
                }
            }
            None => {
                streaks.remove(container_id);
                None
            }
        }
    }

    pub fn forget(&self, container_id: &str) {
        if let Ok(mut streaks) = self.streaks.lock() {
            streaks.remove(container_id);
        }
    }
}
