//! `/proc` readers used for liveness checks and usage sampling.
//!
//! The kernel is the source of truth for whether a container's process
//! exists; nothing here caches.

use std::fs;
use std::path::PathBuf;

/// Fields of `/proc/<pid>/stat` the engine cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    /// Single-letter scheduler state (R, S, D, Z, T, ...)
    pub state: char,
    pub pgrp: i32,
    /// User + system CPU time in clock ticks
    pub cpu_ticks: u64,
    pub num_threads: u32,
    /// Start time since boot in clock ticks
    pub start_ticks: u64,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

fn proc_path(pid: u32, file: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/{}", pid, file))
}

/// Parse a `/proc/<pid>/stat` line. The command name may contain spaces and
/// parentheses, so fields are counted from the last ')'.
pub fn parse_stat(pid: u32, content: &str) -> Option<ProcStat> {
    let close = content.rfind(')')?;
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state)
    let field = |n: usize| rest.get(n - 3).copied();

    let state = field(3)?.chars().next()?;
    let pgrp = field(5)?.parse().ok()?;
    let utime: u64 = field(14)?.parse().ok()?;
    let stime: u64 = field(15)?.parse().ok()?;
    let num_threads = field(20)?.parse().ok()?;
    let start_ticks = field(22)?.parse().ok()?;

    Some(ProcStat {
        pid,
        state,
        pgrp,
        cpu_ticks: utime + stime,
        num_threads,
        start_ticks,
    })
}

pub fn read_stat(pid: u32) -> Option<ProcStat> {
    let content = fs::read_to_string(proc_path(pid, "stat")).ok()?;
    parse_stat(pid, &content)
}

/// True if `pid` names a live (non-zombie) process that is the same
/// process recorded at spawn time.
pub fn process_alive(pid: u32, expected_start_ticks: Option<u64>) -> bool {
    match read_stat(pid) {
        Some(stat) if stat.is_zombie() => false,
        Some(stat) => match expected_start_ticks {
            Some(expected) => stat.start_ticks == expected,
            None => true,
        },
        None => false,
    }
}

/// Resident set size in bytes from `/proc/<pid>/status`
pub fn read_rss_bytes(pid: u32) -> Option<u64> {
    let content = fs::read_to_string(proc_path(pid, "status")).ok()?;
    parse_status_kb(&content, "VmRSS:").map(|kb| kb * 1024)
}

fn parse_status_kb(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

/// Storage-layer bytes read and written. Usually requires same-uid or
/// CAP_SYS_PTRACE; absent counters read as `None`.
pub fn read_io_bytes(pid: u32) -> Option<(u64, u64)> {
    let content = fs::read_to_string(proc_path(pid, "io")).ok()?;
    parse_io(&content)
}

fn parse_io(content: &str) -> Option<(u64, u64)> {
    let mut read = None;
    let mut write = None;
    for line in content.lines() {
        let mut parts = line.split(':');
        match (parts.next(), parts.next()) {
            (Some("read_bytes"), Some(v)) => read = v.trim().parse().ok(),
            (Some("write_bytes"), Some(v)) => write = v.trim().parse().ok(),
            _ => {}
        }
    }
    Some((read?, write?))
}

/// Kernel clock ticks per second (USER_HZ)
pub fn clock_ticks_per_second() -> u64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => 100,
    }
}
