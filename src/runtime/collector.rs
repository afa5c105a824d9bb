//! Metrics collector.
//!
//! A background thread samples every RUNNING container on a fixed interval.
//! It never mutates containers itself: samples, detected exits and limit
//! violations are handed to a [`CollectorSink`], which is the engine.

use crate::config::types::{Container, ContainerState, MetricsSnapshot};
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::procfs;
use crate::runtime::limits::SoftLimitTracker;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MIB: f64 = 1024.0 * 1024.0;

/// Receiver of collector results
pub trait CollectorSink: Send + Sync + 'static {
    /// Containers currently believed RUNNING
    fn running_containers(&self) -> Vec<Container>;
    /// Persist one tick's samples together
    fn record_samples(&self, samples: Vec<(String, MetricsSnapshot)>);
    /// The container's process was found gone
    fn process_exited(&self, container_id: &str);
    /// A soft limit has been exceeded for more than one interval
    fn limit_exceeded(&self, container_id: &str, detail: &str);
}

/// A violation queued for the enforcement thread
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub container_id: String,
    pub detail: String,
}

/// CPU counter reading used to compute utilisation between ticks
#[derive(Debug, Clone, Copy)]
struct CpuMark {
    pid: u32,
    /// Cumulative CPU time in microseconds
    cpu_usec: u64,
    at: Instant,
}

pub struct MetricsCollector {
    history: Mutex<HashMap<String, VecDeque<MetricsSnapshot>>>,
    previous: Mutex<HashMap<String, CpuMark>>,
    history_len: usize,
    cgroup: Option<Arc<dyn CgroupBackend>>,
    tracker: SoftLimitTracker,
    ticks_per_second: u64,
}

impl MetricsCollector {
    pub fn new(history_len: usize, cgroup: Option<Arc<dyn CgroupBackend>>) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            previous: Mutex::new(HashMap::new()),
            history_len: history_len.max(1),
            cgroup,
            tracker: SoftLimitTracker::default(),
            ticks_per_second: procfs::clock_ticks_per_second(),
        }
    }

    /// Take one sample of `container`'s process. `None` means the process
    /// no longer exists (gone, zombie, or pid reused).
    pub fn sample(&self, container: &Container) -> Option<MetricsSnapshot> {
        let pid = container.pid?;
        let stat = procfs::read_stat(pid)?;
        if stat.is_zombie() {
            return None;
        }
        if let Some(expected) = container.pid_start_ticks {
            if stat.start_ticks != expected {
                return None;
            }
        }

        let cgroup_usage = self
            .cgroup
            .as_ref()
            .filter(|backend| backend.exists(&container.id))
            .and_then(|backend| backend.usage(&container.id).ok());

        let cpu_usec = cgroup_usage
            .as_ref()
            .and_then(|usage| usage.cpu_usage_usec)
            .unwrap_or_else(|| stat.cpu_ticks * 1_000_000 / self.ticks_per_second);
        let now = Instant::now();
        let cpu_percent = self.cpu_percent(&container.id, pid, cpu_usec, now);

        let memory_bytes = cgroup_usage
            .as_ref()
            .and_then(|usage| usage.memory_bytes)
            .or_else(|| procfs::read_rss_bytes(pid))
            .unwrap_or(0);
        let thread_count = cgroup_usage
            .as_ref()
            .and_then(|usage| usage.pids)
            .unwrap_or(stat.num_threads);
        let (io_read_bytes, io_write_bytes) = procfs::read_io_bytes(pid).unwrap_or((0, 0));

        let snapshot = MetricsSnapshot {
            cpu_percent,
            memory_mb: memory_bytes as f64 / MIB,
            thread_count,
            io_read_bytes,
            io_write_bytes,
            sampled_at: Utc::now(),
        };
        self.push_history(&container.id, snapshot.clone());
        Some(snapshot)
    }

    fn cpu_percent(&self, container_id: &str, pid: u32, cpu_usec: u64, now: Instant) -> f64 {
        let mut previous = match self.previous.lock() {
            Ok(previous) => previous,
            Err(_) => return 0.0,
        };
        let mark = CpuMark {
            pid,
            cpu_usec,
            at: now,
        };

        match previous.insert(container_id.to_string(), mark) {
            // A restarted container starts a fresh series
            Some(last) if last.pid == pid => {
                let wall_usec = now.duration_since(last.at).as_micros() as f64;
                if wall_usec <= 0.0 {
                    return 0.0;
                }
                cpu_usec.saturating_sub(last.cpu_usec) as f64 / wall_usec * 100.0
            }
            _ => 0.0,
        }
    }

    fn push_history(&self, container_id: &str, snapshot: MetricsSnapshot) {
        if let Ok(mut history) = self.history.lock() {
            let series = history.entry(container_id.to_string()).or_default();
            series.push_back(snapshot);
            while series.len() > self.history_len {
                series.pop_front();
            }
        }
    }

    /// Samples kept for a container, oldest first
    pub fn history(&self, container_id: &str) -> Vec<MetricsSnapshot> {
        self.history
            .lock()
            .ok()
            .and_then(|history| history.get(container_id).map(|s| s.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Drop all per-container state
    pub fn forget(&self, container_id: &str) {
        if let Ok(mut history) = self.history.lock() {
            history.remove(container_id);
        }
        if let Ok(mut previous) = self.previous.lock() {
            previous.remove(container_id);
        }
        self.tracker.forget(container_id);
    }

    /// Sample outside the periodic tick and feed the result to the
    /// violation tracker. Returns the violation once the streak completes.
    pub fn check_limits(&self, container: &Container) -> Option<String> {
        let snapshot = self.sample(container)?;
        self.tracker
            .observe(&container.id, &container.resource_limits, &snapshot)
    }

    /// Reset the violation streak, e.g. once a container has been stopped
    pub fn clear_violations(&self, container_id: &str) {
        self.tracker.forget(container_id);
    }

    /// One sampling pass over all running containers
    pub fn tick(&self, sink: &dyn CollectorSink, violations: &Sender<Violation>) -> usize {
        let mut batch = Vec::new();

        for container in sink.running_containers() {
            if container.state != ContainerState::Running {
                continue;
            }
            match self.sample(&container) {
                Some(snapshot) => {
                    if container.isolation_level.soft_enforcement() {
                        if let Some(detail) =
                            self.tracker
                                .observe(&container.id, &container.resource_limits, &snapshot)
                        {
                            let _ = violations.send(Violation {
                                container_id: container.id.clone(),
                                detail,
                            });
                        }
                    }
                    batch.push((container.id.clone(), snapshot));
                }
                None => {
                    debug!("Process of {} is gone", container.id);
                    sink.process_exited(&container.id);
                }
            }
        }

        let sampled = batch.len();
        if !batch.is_empty() {
            sink.record_samples(batch);
        }
        sampled
    }

    /// Start the sampling and enforcement threads. Both exit when the
    /// shutdown channel receives a message or is disconnected.
    pub fn spawn(
        self: Arc<Self>,
        sink: Arc<dyn CollectorSink>,
        interval: Duration,
        shutdown: Receiver<()>,
    ) -> std::io::Result<Vec<JoinHandle<()>>> {
        let (violation_tx, violation_rx) = crossbeam_channel::unbounded::<Violation>();

        let sampler = {
            let sink = Arc::clone(&sink);
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("botbox-metrics".to_string())
                .spawn(move || {
                    info!("Metrics collector started ({:?} interval)", interval);
                    loop {
                        self.tick(sink.as_ref(), &violation_tx);
                        match shutdown.recv_timeout(interval) {
                            Err(RecvTimeoutError::Timeout) => continue,
                            _ => break,
                        }
                    }
                    info!("Metrics collector stopped");
                })?
        };

        let enforcer = thread::Builder::new()
            .name("botbox-enforcer".to_string())
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(violation_rx) -> msg => match msg {
                        Ok(violation) => {
                            warn!(
                                "Soft limit exceeded by {}: {}",
                                violation.container_id, violation.detail
                            );
                            sink.limit_exceeded(&violation.container_id, &violation.detail);
                        }
                        Err(_) => break,
                    },
                    recv(shutdown) -> _ => break,
                }
            })?;

        Ok(vec![sampler, enforcer])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ContainerSpec, IsolationLevel, ResourceLimits};
    use std::process::Command;

    struct RecordingSink {
        containers: Vec<Container>,
        samples: Mutex<Vec<(String, MetricsSnapshot)>>,
        exited: Mutex<Vec<String>>,
    }

    impl CollectorSink for RecordingSink {
        fn running_containers(&self) -> Vec<Container> {
            self.containers.clone()
        }
        fn record_samples(&self, samples: Vec<(String, MetricsSnapshot)>) {
            self.samples.lock().unwrap().extend(samples);
        }
        fn process_exited(&self, container_id: &str) {
            self.exited.lock().unwrap().push(container_id.to_string());
        }
        fn limit_exceeded(&self, _container_id: &str, _detail: &str) {}
    }

    fn running(pid: u32, limits: ResourceLimits) -> Container {
        let mut container = Container::from_spec(
            ContainerSpec::new("bot", "/bin/sh")
                .with_limits(limits)
                .with_isolation(IsolationLevel::Standard),
        );
        let ticks = procfs::read_stat(pid).map(|s| s.start_ticks);
        container.attach_process(ContainerState::Running, pid, ticks);
        container
    }

    #[test]
    fn test_history_is_bounded() {
        let collector = MetricsCollector::new(3, None);
        let container = running(std::process::id(), ResourceLimits::default());
        for _ in 0..5 {
            assert!(collector.sample(&container).is_some());
        }
        let history = collector.history(&container.id);
        assert_eq!(history.len(), 3);
        assert!(history[0].sampled_at <= history[2].sampled_at);
        assert!(history[2].memory_mb > 0.0);

        collector.forget(&container.id);
        assert!(collector.history(&container.id).is_empty());
    }

    #[test]
    fn test_tick_reports_dead_process_and_violations() {
        let mut child = Command::new("/bin/sh").arg("-c").arg("sleep 30").spawn().unwrap();
        let live = running(
            child.id(),
            ResourceLimits {
                memory_mb: Some(0),
                ..Default::default()
            },
        );
        let mut dead = running(std::process::id(), ResourceLimits::default());
        dead.pid_start_ticks = dead.pid_start_ticks.map(|t| t + 1);

        let sink = RecordingSink {
            containers: vec![live.clone(), dead.clone()],
            samples: Mutex::new(Vec::new()),
            exited: Mutex::new(Vec::new()),
        };
        let collector = MetricsCollector::new(10, None);
        let (tx, rx) = crossbeam_channel::unbounded();

        assert_eq!(collector.tick(&sink, &tx), 1);
        assert!(rx.try_recv().is_err());
        collector.tick(&sink, &tx);
        let violation = rx.try_recv().unwrap();
        assert_eq!(violation.container_id, live.id);
        assert!(violation.detail.starts_with("memory"));

        assert_eq!(sink.exited.lock().unwrap().as_slice(), &[dead.id.clone(), dead.id]);
        assert_eq!(sink.samples.lock().unwrap().len(), 2);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_check_limits_needs_two_samples() {
        let collector = MetricsCollector::new(10, None);
        let container = running(
            std::process::id(),
            ResourceLimits {
                memory_mb: Some(0),
                ..Default::default()
            },
        );

        assert!(collector.check_limits(&container).is_none());
        let detail = collector.check_limits(&container).unwrap();
        assert!(detail.starts_with("memory"));
        assert_eq!(collector.history(&container.id).len(), 2);
    }

    #[test]
    fn test_threads_stop_on_shutdown() {
        let sink: Arc<dyn CollectorSink> = Arc::new(RecordingSink {
            containers: Vec::new(),
            samples: Mutex::new(Vec::new()),
            exited: Mutex::new(Vec::new()),
        });
        let collector = Arc::new(MetricsCollector::new(10, None));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let handles = collector
            .spawn(sink, Duration::from_millis(10), shutdown_rx)
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        drop(shutdown_tx);
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
