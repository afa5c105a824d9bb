//! Per-process limits applied between `fork` and `exec`.
//!
//! Everything in this module may run inside a `pre_exec` hook, so it must
//! stay async-signal-safe: no allocation, no locks, no logging.

use nix::sys::resource::{setrlimit, Resource};
use std::ffi::CStr;
use std::io;

/// Set soft and hard limit of `resource` to `value`
pub fn set_rlimit(resource: Resource, value: u64) -> io::Result<()> {
    setrlimit(resource, value, value).map_err(io::Error::from)
}

/// Lower the scheduling priority of the calling process
pub fn set_nice(nice: i32) -> io::Result<()> {
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Move the calling process into the cgroup whose `cgroup.procs` file is
/// `procs_path`. Writing "0" names the writer itself.
pub fn attach_self_to_cgroup(procs_path: &CStr) -> io::Result<()> {
    let fd = unsafe { libc::open(procs_path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
    let result = if written == 1 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    };
    unsafe { libc::close(fd) };
    result
}

/// Map a CPU share to a niceness for hosts without a cpu controller.
/// A full core or more keeps the default priority.
pub fn nice_for_cpu_percent(cpu_percent: u32) -> i32 {
    if cpu_percent >= 100 {
        return 0;
    }
    (((100 - cpu_percent) as i32) / 5).clamp(0, 19)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_nice_mapping() {
        assert_eq!(nice_for_cpu_percent(100), 0);
        assert_eq!(nice_for_cpu_percent(250), 0);
        assert_eq!(nice_for_cpu_percent(50), 10);
        assert_eq!(nice_for_cpu_percent(0), 19);
    }

    #[test]
    fn test_core_limit_applies_in_child() {
        let output = unsafe {
            Command::new("/bin/sh")
                .arg("-c")
                .arg("ulimit -c")
                .pre_exec(|| set_rlimit(Resource::RLIMIT_CORE, 0))
                .output()
                .unwrap()
        };
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0");
    }

    #[test]
    fn test_attach_to_missing_cgroup_fails() {
        let path = std::ffi::CString::new("/nonexistent/botbox/cgroup.procs").unwrap();
        assert!(attach_self_to_cgroup(&path).is_err());
    }
}
