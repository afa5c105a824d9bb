//! Cgroup resource governance
//!
//! Per-container cgroup v2 groups; hosts without a usable hierarchy fall back
//! to rlimits.

pub mod backend;
pub mod v2;

// Re-export commonly used items
pub use backend::{detect_cgroup_backend, CgroupBackend, CgroupLimits, CgroupUsage};
pub use v2::CgroupV2;
