//! Portable snapshots of container entries.

use crate::config::types::{Container, EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// What to export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    One(String),
    All,
}

/// Exported container entries with an integrity digest over `containers`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportBundle {
    pub format_version: u32,
    pub botbox_version: String,
    pub exported_at: DateTime<Utc>,
    pub containers: Vec<Container>,
    /// Hex sha256 of the compact JSON encoding of `containers`
    pub digest: String,
}

impl ExportBundle {
    pub fn new(containers: Vec<Container>) -> Result<Self> {
        let digest = Self::compute_digest(&containers)?;
        Ok(Self {
            format_version: BUNDLE_FORMAT_VERSION,
            botbox_version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            containers,
            digest,
        })
    }

    pub fn compute_digest(containers: &[Container]) -> Result<String> {
        let encoded = serde_json::to_vec(containers)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Reject bundles from newer formats or with a mismatching digest
    pub fn verify(&self) -> Result<()> {
        if self.format_version > BUNDLE_FORMAT_VERSION {
            return Err(EngineError::Validation(format!(
                "bundle format {} is newer than supported format {}",
                self.format_version, BUNDLE_FORMAT_VERSION
            )));
        }
        let actual = Self::compute_digest(&self.containers)?;
        if actual != self.digest {
            return Err(EngineError::Validation(format!(
                "bundle digest mismatch: expected {}, computed {}",
                self.digest, actual
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Validation(format!("invalid export bundle: {}", e)))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!("cannot read bundle {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
