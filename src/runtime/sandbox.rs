//! Filesystem sandbox for container processes.
//!
//! STANDARD and STRICT containers run from a private root under
//! `containers/<id>/rootfs`: the image is copied to `app/`, read-write
//! volumes are symlinked to their host paths and read-only volumes are
//! copied in with write bits stripped. Host mounts are never created, so a
//! crashed engine cannot leak mount points. STRICT additionally lists the
//! writable volume sources, the only places its process may write to.

use crate::config::types::{Container, EngineError, Result, SandboxStrategy, VolumeBinding};
use crate::safety::safe_cleanup::remove_tree_secure;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

const ROOTFS_DIR: &str = "rootfs";
const APP_DIR: &str = "app";
const OUTPUT_LOG: &str = "output.log";

/// Everything the supervisor needs to launch a prepared container
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLayout {
    /// Private root, absent for host-direct containers
    pub root: Option<PathBuf>,
    pub program: PathBuf,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    /// Variables added on top of the container's own environment
    pub env: Vec<(String, String)>,
    /// Host paths writes are confined to; `None` leaves writes unrestricted
    pub writable: Option<Vec<PathBuf>>,
}

/// Builds and tears down per-container roots under `containers_dir`
#[derive(Debug, Clone)]
pub struct FilesystemSandbox {
    containers_dir: PathBuf,
}

impl FilesystemSandbox {
    pub fn new(containers_dir: impl Into<PathBuf>) -> Self {
        Self {
            containers_dir: containers_dir.into(),
        }
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir.join(id)
    }

    pub fn root_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(ROOTFS_DIR)
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(OUTPUT_LOG)
    }

    /// Device of the container directory as (major, minor), for io.max
    pub fn io_device(&self, id: &str) -> Option<(u64, u64)> {
        let dev = fs::metadata(self.container_dir(id)).ok()?.dev();
        Some((nix::sys::stat::major(dev), nix::sys::stat::minor(dev)))
    }

    /// Prepare the container's working root. Leftovers from an earlier
    /// start are torn down first.
    pub fn prepare(&self, container: &Container) -> Result<SandboxLayout> {
        let container_dir = self.container_dir(&container.id);
        fs::create_dir_all(&container_dir).map_err(|e| {
            sandbox_error(format!("create {}: {}", container_dir.display(), e))
        })?;
        self.teardown_root(&container.id)?;

        let mut env = vec![
            ("BOTBOX_CONTAINER_ID".to_string(), container.id.clone()),
            ("BOTBOX_CONTAINER_NAME".to_string(), container.name.clone()),
        ];
        let log_path = self.log_path(&container.id);

        let strategy = container.isolation_level.sandbox_strategy();
        if strategy == SandboxStrategy::HostDirect {
            let program = absolute(&container.image)?;
            let working_dir = program
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            return Ok(SandboxLayout {
                root: None,
                program,
                working_dir,
                log_path,
                env,
                writable: None,
            });
        }

        let root = self.root_path(&container.id);
        let app_dir = root.join(APP_DIR);
        fs::create_dir_all(&app_dir)
            .map_err(|e| sandbox_error(format!("create {}: {}", app_dir.display(), e)))?;

        let file_name = container.image.file_name().ok_or_else(|| {
            sandbox_error(format!("image {} has no file name", container.image.display()))
        })?;
        let program = app_dir.join(file_name);
        fs::copy(&container.image, &program).map_err(|e| {
            sandbox_error(format!("copy image {}: {}", container.image.display(), e))
        })?;

        for volume in &container.volumes {
            bind_volume(&root, volume)?;
        }

        let mut writable = None;
        if strategy == SandboxStrategy::ReadOnlyRoot {
            writable = Some(
                container
                    .volumes
                    .iter()
                    .filter(|v| !v.read_only)
                    .map(|v| v.host_path.clone())
                    .collect(),
            );
            make_read_only(&root)
                .map_err(|e| sandbox_error(format!("seal {}: {}", root.display(), e)))?;
            if let Some(writable) = container.volumes.iter().find(|v| !v.read_only) {
                let home = root_target(&root, &writable.container_path)?;
                let home = home.to_string_lossy().into_owned();
                env.push(("HOME".to_string(), home.clone()));
                env.push(("TMPDIR".to_string(), home));
            }
        }

        env.push((
            "BOTBOX_ROOT".to_string(),
            root.to_string_lossy().into_owned(),
        ));

        log::debug!(
            "Prepared {:?} sandbox for {} at {}",
            strategy,
            container.id,
            root.display()
        );
        Ok(SandboxLayout {
            root: Some(root),
            program,
            working_dir: app_dir,
            log_path,
            env,
            writable,
        })
    }

    /// Remove the private root, keeping the output log
    pub fn teardown_root(&self, id: &str) -> Result<()> {
        remove_tree_secure(&self.root_path(id))
    }

    /// Remove everything the engine keeps for a container
    pub fn remove_all(&self, id: &str) -> Result<()> {
        remove_tree_secure(&self.container_dir(id))
    }
}

fn sandbox_error(detail: String) -> EngineError {
    EngineError::Spawn(detail)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path))
}

/// Map an absolute container path to its location inside `root`
fn root_target(root: &Path, container_path: &Path) -> Result<PathBuf> {
    let mut target = root.to_path_buf();
    for component in container_path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => target.push(part),
            _ => {
                return Err(sandbox_error(format!(
                    "container path {} escapes the root",
                    container_path.display()
                )))
            }
        }
    }
    if target == root {
        return Err(sandbox_error("volume cannot replace the root".to_string()));
    }
    Ok(target)
}

fn bind_volume(root: &Path, volume: &VolumeBinding) -> Result<()> {
    let target = root_target(root, &volume.container_path)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| sandbox_error(format!("create {}: {}", parent.display(), e)))?;
    }
    if !volume.host_path.exists() {
        return Err(sandbox_error(format!(
            "volume source {} does not exist",
            volume.host_path.display()
        )));
    }

    if volume.read_only {
        copy_tree(&volume.host_path, &target)
            .and_then(|()| make_read_only(&target))
            .map_err(|e| {
                sandbox_error(format!(
                    "copy read-only volume {}: {}",
                    volume.host_path.display(),
                    e
                ))
            })
    } else {
        symlink(&volume.host_path, &target).map_err(|e| {
            sandbox_error(format!(
                "link {} -> {}: {}",
                target.display(),
                volume.host_path.display(),
                e
            ))
        })
    }
}

/// Copy files and directories; other entry types are skipped
fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    let meta = fs::metadata(source)?;
    if meta.is_file() {
        fs::copy(source, target)?;
        return Ok(());
    }

    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&source_path, &target_path)?;
        } else if file_type.is_file() {
            fs::copy(&source_path, &target_path)?;
        } else {
            log::debug!("Skipping {} while copying volume", source_path.display());
        }
    }
    Ok(())
}

/// Strip write bits below `path`, children before parents. Symlinks are
/// left alone so writable volume links keep pointing at the host.
fn make_read_only(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            make_read_only(&entry?.path())?;
        }
    }
    let mode = meta.permissions().mode() & !0o222;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ContainerSpec, IsolationLevel};

    fn image_dir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("bot.sh");
        fs::write(&image, "#!/bin/sh\necho hello\n").unwrap();
        fs::set_permissions(&image, fs::Permissions::from_mode(0o755)).unwrap();
        (dir, image)
    }

    #[test]
    fn test_minimal_runs_in_place() {
        let (image_dir, image) = image_dir();
        let work = tempfile::tempdir().unwrap();
        let sandbox = FilesystemSandbox::new(work.path());
        let container = Container::from_spec(
            ContainerSpec::new("bot", &image).with_isolation(IsolationLevel::Minimal),
        );

        let layout = sandbox.prepare(&container).unwrap();
        assert!(layout.root.is_none());
        assert_eq!(layout.program, image);
        assert_eq!(layout.working_dir, image_dir.path());
        assert!(sandbox.container_dir(&container.id).is_dir());
    }

    #[test]
    fn test_standard_copies_image_and_links_volumes() {
        let (_image_dir, image) = image_dir();
        let data = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        fs::write(config.path().join("settings.json"), b"{}").unwrap();

        let work = tempfile::tempdir().unwrap();
        let sandbox = FilesystemSandbox::new(work.path());
        let container = Container::from_spec(
            ContainerSpec::new("bot", &image)
                .with_volume(VolumeBinding {
                    host_path: data.path().to_path_buf(),
                    container_path: PathBuf::from("/data"),
                    read_only: false,
                })
                .with_volume(VolumeBinding {
                    host_path: config.path().to_path_buf(),
                    container_path: PathBuf::from("/etc/bot"),
                    read_only: true,
                }),
        );

        let layout = sandbox.prepare(&container).unwrap();
        let root = layout.root.clone().unwrap();
        assert!(layout.program.starts_with(&root));
        assert!(layout.writable.is_none());
        let mode = fs::metadata(&layout.program).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);

        let link = root.join("data");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        fs::write(link.join("state.txt"), b"ok").unwrap();
        assert!(data.path().join("state.txt").exists());

        let copied = root.join("etc/bot/settings.json");
        let copied_mode = fs::metadata(&copied).unwrap().permissions().mode();
        assert_eq!(copied_mode & 0o222, 0);

        sandbox.teardown_root(&container.id).unwrap();
        assert!(!root.exists());
        assert!(data.path().join("state.txt").exists());
        assert!(config.path().join("settings.json").exists());
    }

    #[test]
    fn test_strict_root_is_read_only_with_writable_home() {
        let (_image_dir, image) = image_dir();
        let data = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let sandbox = FilesystemSandbox::new(work.path());
        let container = Container::from_spec(
            ContainerSpec::new("bot", &image)
                .with_isolation(IsolationLevel::Strict)
                .with_volume(VolumeBinding {
                    host_path: data.path().to_path_buf(),
                    container_path: PathBuf::from("/data"),
                    read_only: false,
                }),
        );

        let layout = sandbox.prepare(&container).unwrap();
        let root = layout.root.clone().unwrap();
        let root_mode = fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(root_mode & 0o222, 0);

        let home = layout
            .env
            .iter()
            .find(|(k, _)| k == "HOME")
            .map(|(_, v)| PathBuf::from(v))
            .unwrap();
        assert_eq!(home, root.join("data"));
        assert_eq!(layout.writable, Some(vec![data.path().to_path_buf()]));

        // Re-preparing tears the sealed root down first
        sandbox.prepare(&container).unwrap();
        sandbox.remove_all(&container.id).unwrap();
        assert!(!sandbox.container_dir(&container.id).exists());
    }

    #[test]
    fn test_missing_volume_source_fails() {
        let (_image_dir, image) = image_dir();
        let work = tempfile::tempdir().unwrap();
        let sandbox = FilesystemSandbox::new(work.path());
        let container = Container::from_spec(
            ContainerSpec::new("bot", &image)
                .with_volume(VolumeBinding::parse("/nonexistent/botbox:/data").unwrap()),
        );

        match sandbox.prepare(&container) {
            Err(EngineError::Spawn(detail)) => assert!(detail.contains("does not exist")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
