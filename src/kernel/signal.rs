//! Signal delivery to container process groups.
//!
//! Every container process is spawned as a session leader, so its pid is
//! also its process group id. Signals go to the whole group first and fall
//! back to the leader alone when the group is already gone.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Outcome of a group signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Group,
    LeaderOnly,
    /// Neither the group nor the leader exists
    Gone,
}

/// Send `signal` to the process group led by `pid`
pub fn signal_group(pid: u32, signal: Signal) -> Result<Delivery, Errno> {
    let raw = Pid::from_raw(pid as i32);
    match killpg(raw, signal) {
        Ok(()) => Ok(Delivery::Group),
        Err(Errno::ESRCH) => match kill(raw, signal) {
            Ok(()) => {
                log::debug!("group {} gone, {} sent to leader only", pid, signal);
                Ok(Delivery::LeaderOnly)
            }
            Err(Errno::ESRCH) => Ok(Delivery::Gone),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// Kill the whole group immediately, ignoring a group that has already exited
pub fn kill_group(pid: u32) {
    if let Err(e) = signal_group(pid, Signal::SIGKILL) {
        log::warn!("SIGKILL to process group {} failed: {}", pid, e);
    }
}

/// SIGKILL whatever is left of a group whose leader has already been reaped.
/// Never falls back to the bare pid, which may have been reused.
pub fn kill_stragglers(pgid: u32) {
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => log::debug!("killed leftover members of process group {}", pgid),
        Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("SIGKILL to leftover group {} failed: {}", pgid, e),
    }
}

/// Exit code convention for a process terminated by `signal`
pub fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}
