//! botbox: a Docker-free container engine for bot worker processes
//!
//! # Architecture
//!
//! ## Engine ([`engine`])
//! - [`engine::Engine`]: lifecycle operations, per-container guards, restart policy
//! - [`engine::recovery`]: startup reconciliation against `/proc`
//! - [`engine::export`]: portable bundles with a sha256 digest
//!
//! ## Runtime ([`runtime`])
//! - [`runtime::sandbox`]: private container roots built from copies and symlinks
//! - [`runtime::supervisor`]: spawn, poll and terminate process groups
//! - [`runtime::limits`]: hard limits at spawn, soft limit streaks
//! - [`runtime::collector`]: background sampling and enforcement threads
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: cgroup v2 backend
//! - [`kernel::confinement`]: Landlock write confinement for STRICT
//! - [`kernel::procfs`]: `/proc/<pid>` parsing
//! - [`kernel::rlimit`]: rlimits, niceness, cgroup self-attach
//! - [`kernel::signal`]: process group signalling
//!
//! ## Safety ([`safety`])
//! - [`safety::store`]: crash-safe registry with flock transactions
//! - [`safety::lock_manager`]: the store lock
//! - [`safety::safe_cleanup`]: tree removal that never follows symlinks
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured lifecycle events
//! - [`observability::metrics`]: engine counters
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: containers, limits, errors
//! - [`config::engine`]: engine settings
//! - [`config::validator`]: spec and limit validation

// Kernel Primitives
pub mod kernel;

// Per-container runtime
pub mod runtime;

// Lifecycle facade
pub mod engine;

// Safety & Persistence
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// CLI entrypoint wiring for the botbox binary
pub mod cli;

pub use config::engine::EngineConfig;
pub use config::types::*;
pub use engine::export::{ExportBundle, ExportTarget};
pub use engine::{ContainerStats, Engine};
