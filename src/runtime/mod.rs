//! Per-container runtime: sandbox, process supervision, limits, sampling.

pub mod collector;
pub mod limits;
pub mod sandbox;
pub mod supervisor;

pub use collector::{CollectorSink, MetricsCollector};
pub use limits::{HardLimitPlan, SoftLimitTracker};
pub use sandbox::{FilesystemSandbox, SandboxLayout};
pub use supervisor::{ExitInfo, ProcessStatus, ProcessSupervisor};
