//! Durable container registry.
//!
//! `registry.json` is only ever replaced by atomic rename, so readers without
//! the lock always see a complete registry. Every mutation goes through
//! [`StateStore::transact`]: lock, load, mutate, write.

use crate::config::types::{Container, EngineError, Result};
use crate::safety::lock_manager::StoreLock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REGISTRY_VERSION: u32 = 1;

const REGISTRY_FILE: &str = "registry.json";
const LOCK_FILE: &str = "registry.lock";
const ARCHIVE_FILE: &str = "archive.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";
const CONTAINERS_DIR: &str = "containers";
const OUTPUT_LOG: &str = "output.log";

/// On-disk registry document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    pub version: u32,
    #[serde(default)]
    pub containers: BTreeMap<String, Container>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            containers: BTreeMap::new(),
        }
    }
}

impl Registry {
    /// Look up by id, then by name
    pub fn resolve(&self, id_or_name: &str) -> Option<&Container> {
        self.containers.get(id_or_name).or_else(|| {
            self.containers
                .values()
                .find(|container| container.name == id_or_name)
        })
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.containers.values().any(|c| c.name == name)
    }
}

/// A removed container as kept in the archive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveRecord {
    pub removed_at: DateTime<Utc>,
    pub container: Container,
}

/// Write `content` to `target` via temp file, fsync, rename, directory fsync
pub fn atomic_write(target: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent dir"))?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        target.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    {
        let mut f = fs::File::create(&temp_path)?;
        f.write_all(content)?;
        f.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    // The rename is only durable once the directory entry is synced
    match fs::File::open(parent).and_then(|dir| dir.sync_all()) {
        Ok(()) => {}
        Err(e) => log::warn!("fsync of {} failed: {}", parent.display(), e),
    }
    Ok(())
}

pub struct StateStore {
    root: PathBuf,
    lock: StoreLock,
    lock_timeout: Duration,
}

impl StateStore {
    /// Open the store under `root`, creating its layout if needed
    pub fn open(root: &Path, lock_timeout: Duration) -> Result<Self> {
        fs::create_dir_all(root.join(CONTAINERS_DIR)).map_err(|e| {
            EngineError::Persistence(format!(
                "cannot create storage root {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            lock: StoreLock::new(root.join(LOCK_FILE)),
            lock_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join(ARCHIVE_FILE)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    /// Per-container directory holding the sandbox root and output log
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    pub fn output_log_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(OUTPUT_LOG)
    }

    /// Read the registry without taking the lock
    pub fn load(&self) -> Result<Registry> {
        let path = self.registry_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Registry::default()),
            Err(e) => {
                return Err(EngineError::Persistence(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let registry: Registry = serde_json::from_str(&content).map_err(|e| {
            EngineError::Persistence(format!("corrupt registry {}: {}", path.display(), e))
        })?;
        if registry.version > REGISTRY_VERSION {
            return Err(EngineError::Persistence(format!(
                "registry version {} is newer than supported version {}",
                registry.version, REGISTRY_VERSION
            )));
        }
        Ok(registry)
    }

    fn write(&self, registry: &Registry) -> Result<()> {
        let json = serde_json::to_vec_pretty(registry)?;
        atomic_write(&self.registry_path(), &json).map_err(|e| {
            EngineError::Persistence(format!(
                "cannot write {}: {}",
                self.registry_path().display(),
                e
            ))
        })
    }

    /// Run one read-modify-write cycle under the store lock. An error from
    /// `mutate` aborts without writing. Returns the closure's value and the
    /// registry as persisted.
    pub fn transact<T, F>(&self, mutate: F) -> Result<(T, Registry)>
    where
        F: FnOnce(&mut Registry) -> Result<T>,
    {
        let _guard = self.lock.acquire(self.lock_timeout)?;
        let mut registry = self.load()?;
        let value = mutate(&mut registry)?;
        registry.version = REGISTRY_VERSION;
        self.write(&registry)?;
        Ok((value, registry))
    }

    /// Append a removed container to the archive. Called only after the
    /// removal has been committed to the registry.
    pub fn archive(&self, container: &Container) -> Result<()> {
        let record = ArchiveRecord {
            removed_at: Utc::now(),
            container: container.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.archive_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// All archived containers, oldest first. Unparseable lines are skipped.
    pub fn read_archive(&self) -> Result<Vec<ArchiveRecord>> {
        let file = match fs::File::open(self.archive_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable archive line: {}", e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ContainerSpec, ContainerState};

    fn open_store(dir: &Path) -> StateStore {
        StateStore::open(dir, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_transaction_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let container = Container::from_spec(ContainerSpec::new("bot", "/bin/true"));
        let id = container.id.clone();

        store
            .transact(|registry| {
                registry.containers.insert(id.clone(), container);
                Ok(())
            })
            .unwrap();

        let reopened = open_store(dir.path());
        let registry = reopened.load().unwrap();
        assert_eq!(registry.version, REGISTRY_VERSION);
        assert_eq!(registry.resolve("bot").unwrap().id, id);
        assert_eq!(registry.resolve(&id).unwrap().state, ContainerState::Created);
    }

    #[test]
    fn test_failed_closure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let result: Result<((), Registry)> = store.transact(|registry| {
            let container = Container::from_spec(ContainerSpec::new("bot", "/bin/true"));
            registry.containers.insert(container.id.clone(), container);
            Err(EngineError::Validation("rejected".into()))
        });

        assert!(result.is_err());
        assert!(store.load().unwrap().containers.is_empty());
        assert!(!store.registry_path().exists());
    }

    #[test]
    fn test_corrupt_registry_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        fs::write(store.registry_path(), b"{ not json").unwrap();

        assert!(matches!(store.load(), Err(EngineError::Persistence(_))));
        // A transaction must not paper over the corruption
        assert!(store.transact(|_| Ok(())).is_err());
        assert_eq!(fs::read(store.registry_path()).unwrap(), b"{ not json");
    }

    #[test]
    fn test_archive_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        for name in ["first", "second"] {
            let container = Container::from_spec(ContainerSpec::new(name, "/bin/true"));
            store.archive(&container).unwrap();
        }

        let records = store.read_archive().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].container.name, "first");
        assert_eq!(records[1].container.name, "second");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("registry.json");
        atomic_write(&target, b"{}").unwrap();
        atomic_write(&target, b"{\"version\":1}").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(fs::read(&target).unwrap(), b"{\"version\":1}");
    }
}
