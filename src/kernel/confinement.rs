//! Filesystem write confinement through Landlock.
//!
//! The ruleset is built in the parent, where allocating and opening paths
//! is allowed, and only enforced by the child between fork and exec.
//! Reads are not handled by the ruleset and stay unrestricted; every write
//! right is handled, so writes succeed only beneath the granted paths.

use crate::config::types::{EngineError, Result};
use landlock::{
    AccessFs, CompatLevel, Compatible, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreated,
    RulesetCreatedAttr, ABI,
};
use std::io;
use std::path::Path;

/// First ABI, available on every kernel that has Landlock at all
const TARGET_ABI: ABI = ABI::V1;

/// Character devices a confined process may still write to
const WRITABLE_DEVICES: &[&str] = &["/dev/null"];

/// A created but not yet enforced write ruleset
pub struct WriteConfinement {
    ruleset: RulesetCreated,
}

impl WriteConfinement {
    /// Create a ruleset allowing writes beneath `writable` only. Fails when
    /// the kernel cannot enforce it; there is no best-effort mode.
    pub fn prepare<P: AsRef<Path>>(writable: &[P]) -> Result<Self> {
        let write = AccessFs::from_write(TARGET_ABI);
        let mut ruleset = Ruleset::default()
            .set_compatibility(CompatLevel::HardRequirement)
            .handle_access(write)
            .and_then(|ruleset| ruleset.create())
            .map_err(|e| unavailable(e.to_string()))?;

        let devices = WRITABLE_DEVICES.iter().map(Path::new);
        for path in writable.iter().map(AsRef::as_ref).chain(devices) {
            let fd = PathFd::new(path).map_err(|e| {
                EngineError::Spawn(format!("cannot open {} for confinement: {}", path.display(), e))
            })?;
            // Directory-only rights are rejected on non-directories
            let access = if path.is_dir() {
                write
            } else {
                write & AccessFs::from_file(TARGET_ABI)
            };
            ruleset = ruleset
                .add_rule(PathBeneath::new(fd, access))
                .map_err(|e| {
                    EngineError::Spawn(format!("cannot grant writes to {}: {}", path.display(), e))
                })?;
        }

        log::debug!("Prepared write confinement for {} path(s)", writable.len());
        Ok(Self { ruleset })
    }

    /// Enforce the ruleset on the calling process. Runs in the forked
    /// child; the error carries only an errno.
    pub fn enforce(self) -> io::Result<()> {
        self.ruleset
            .restrict_self()
            .map(|_| ())
            .map_err(|_| io::Error::from_raw_os_error(libc::EPERM))
    }
}

/// Whether this kernel can enforce write confinement
pub fn is_supported() -> bool {
    WriteConfinement::prepare::<&Path>(&[]).is_ok()
}

fn unavailable(detail: String) -> EngineError {
    EngineError::Spawn(format!("write confinement unavailable: {}", detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_confined_child_writes_only_beneath_grants() {
        if !is_supported() {
            assert!(WriteConfinement::prepare::<&Path>(&[]).is_err());
            return;
        }

        let allowed = tempfile::tempdir().unwrap();
        let denied = tempfile::tempdir().unwrap();
        let mut confinement = Some(WriteConfinement::prepare(&[allowed.path()]).unwrap());

        let script = format!(
            "echo ok > {}/in.txt; echo quiet > /dev/null; echo no > {}/out.txt",
            allowed.path().display(),
            denied.path().display()
        );
        let status = unsafe {
            Command::new("/bin/sh")
                .arg("-c")
                .arg(&script)
                .pre_exec(move || match confinement.take() {
                    Some(confinement) => confinement.enforce(),
                    None => Ok(()),
                })
                .status()
                .unwrap()
        };

        assert!(!status.success());
        assert!(allowed.path().join("in.txt").exists());
        assert!(!denied.path().join("out.txt").exists());
    }
}
