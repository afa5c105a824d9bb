//! Tree removal for sandbox roots.
//!
//! Sandbox roots contain symlinks to host volumes and may have been made
//! read-only, so removal works on directory fds: symlinks are unlinked,
//! never followed, directory write permission is restored before its
//! entries are removed, and a directory on another device is refused.

use crate::config::types::{EngineError, Result};
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct FdGuard(RawFd);

impl FdGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

fn cleanup_error(context: &str, detail: impl std::fmt::Display) -> EngineError {
    EngineError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{}: {}", context, detail),
    ))
}

fn to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| cleanup_error("path contains NUL byte", path.display()))
}

fn open_dir_nofollow(path: &Path) -> Result<FdGuard> {
    let path_c = to_cstring(path)?;
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if fd < 0 {
        return Err(cleanup_error(
            &format!("open directory {}", path.display()),
            io::Error::last_os_error(),
        ));
    }
    Ok(FdGuard(fd))
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            parent_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(cleanup_error(
            &format!("fstatat {:?}", name),
            io::Error::last_os_error(),
        ));
    }
    Ok(unsafe { st.assume_init() })
}

fn remove_entry_at(parent_fd: RawFd, name: &CStr, flags: i32) -> Result<()> {
    let rc = unsafe { libc::unlinkat(parent_fd, name.as_ptr(), flags) };
    if rc != 0 {
        return Err(cleanup_error(
            &format!("unlinkat {:?}", name),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Owner rwx so the directory's entries can be listed and unlinked
fn restore_dir_permissions(dir_fd: RawFd) -> Result<()> {
    let rc = unsafe { libc::fchmod(dir_fd, 0o700) };
    if rc != 0 {
        return Err(cleanup_error("fchmod", io::Error::last_os_error()));
    }
    Ok(())
}

fn recurse_remove_dir(parent_fd: RawFd, name: &CStr, root_dev: libc::dev_t) -> Result<()> {
    let child_fd = unsafe {
        libc::openat(
            parent_fd,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if child_fd < 0 {
        return Err(cleanup_error(
            &format!("openat {:?}", name),
            io::Error::last_os_error(),
        ));
    }
    let child = FdGuard(child_fd);

    restore_dir_permissions(child.as_raw_fd())?;
    remove_dir_contents_fd(child.as_raw_fd(), root_dev)?;
    remove_entry_at(parent_fd, name, libc::AT_REMOVEDIR)
}

fn remove_dir_contents_fd(dir_fd: RawFd, root_dev: libc::dev_t) -> Result<()> {
    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(cleanup_error("dup", io::Error::last_os_error()));
    }

    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        unsafe {
            libc::close(iter_fd);
        }
        return Err(cleanup_error("fdopendir", io::Error::last_os_error()));
    }

    // Collect names first so unlinking never races the directory stream
    let mut names = Vec::new();
    loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(dir) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            unsafe {
                libc::closedir(dir);
            }
            if errno != 0 {
                return Err(cleanup_error(
                    "readdir",
                    io::Error::from_raw_os_error(errno),
                ));
            }
            break;
        }

        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes != b"." && bytes != b".." {
            names.push(name.to_owned());
        }
    }

    for name in names {
        let st = fstatat_nofollow(dir_fd, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(cleanup_error(
                    "refusing to cross filesystem boundary at",
                    format!("{:?}", name),
                ));
            }
            recurse_remove_dir(dir_fd, &name, root_dev)?;
        } else {
            remove_entry_at(dir_fd, &name, 0)?;
        }
    }

    Ok(())
}

/// Remove `path` and everything below it. A missing path is not an error;
/// a symlink at `path` is unlinked without touching its target.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path
        .parent()
        .ok_or_else(|| cleanup_error("cannot remove path without parent", path.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| cleanup_error("cannot remove path without file name", path.display()))?;
    let name_c = CString::new(name.as_bytes())
        .map_err(|_| cleanup_error("path contains NUL byte", path.display()))?;

    let parent_fd = open_dir_nofollow(parent)?;
    let st = fstatat_nofollow(parent_fd.as_raw_fd(), &name_c)?;

    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        recurse_remove_dir(parent_fd.as_raw_fd(), &name_c, st.st_dev)?;
    } else {
        remove_entry_at(parent_fd.as_raw_fd(), &name_c, 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::{symlink, PermissionsExt};

    #[test]
    fn test_symlink_target_survives() {
        let host = tempfile::tempdir().unwrap();
        fs::write(host.path().join("keep.txt"), b"host data").unwrap();

        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("rootfs");
        fs::create_dir_all(root.join("app")).unwrap();
        symlink(host.path(), root.join("data")).unwrap();

        remove_tree_secure(&root).unwrap();
        assert!(!root.exists());
        assert!(host.path().join("keep.txt").exists());
    }

    #[test]
    fn test_read_only_tree_is_removed() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("rootfs");
        let nested = root.join("etc").join("bot");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("config.json"), b"{}").unwrap();

        for dir in [&nested, &root.join("etc"), &root] {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o555)).unwrap();
        }

        remove_tree_secure(&root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_path_is_ok() {
        let work = tempfile::tempdir().unwrap();
        assert!(remove_tree_secure(&work.path().join("absent")).is_ok());
    }
}
