pub mod cgroup;
pub mod confinement;
pub mod procfs;
pub mod rlimit;
pub mod signal;
