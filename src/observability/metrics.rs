// Engine counters
//
// Lock-free counters and gauges for lifecycle outcomes. Reads are relaxed;
// the values are operational signals, not a consistency mechanism.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-engine lifecycle counters
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub containers_created: Counter,
    pub containers_started: Counter,
    pub containers_stopped: Counter,
    pub containers_failed: Counter,
    pub containers_removed: Counter,
    pub restarts_scheduled: Counter,
    pub soft_limit_violations: Counter,
    pub forced_kills: Counter,
    pub recovered_entries: Counter,
    pub samples_taken: Counter,
    pub running: Gauge,
}

/// Point-in-time copy of [`EngineCounters`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub containers_created: u64,
    pub containers_started: u64,
    pub containers_stopped: u64,
    pub containers_failed: u64,
    pub containers_removed: u64,
    pub restarts_scheduled: u64,
    pub soft_limit_violations: u64,
    pub forced_kills: u64,
    pub recovered_entries: u64,
    pub samples_taken: u64,
    pub running: u64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            containers_created: self.containers_created.get(),
            containers_started: self.containers_started.get(),
            containers_stopped: self.containers_stopped.get(),
            containers_failed: self.containers_failed.get(),
            containers_removed: self.containers_removed.get(),
            restarts_scheduled: self.restarts_scheduled.get(),
            soft_limit_violations: self.soft_limit_violations.get(),
            forced_kills: self.forced_kills.get(),
            recovered_entries: self.recovered_entries.get(),
            samples_taken: self.samples_taken.get(),
            running: self.running.get(),
        }
    }
}
