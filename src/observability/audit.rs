/// Structured audit trail of container lifecycle events
///
/// Every event is echoed to the `log` facade at a level derived from its
/// severity and appended as one JSON line to `audit.jsonl` under the
/// storage root.
use crate::config::types::{Container, EngineError, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Audit event severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of lifecycle events we track
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditEventType {
    ContainerCreated,
    ContainerStarted,
    StartFailed,
    ContainerStopped,
    ContainerExited,
    ContainerFailed,
    ContainerRemoved,
    LimitsUpdated,
    ResourceLimitViolation,
    ForcedKill,
    RestartScheduled,
    StateRecovered,
    ContainerImported,
    CleanupFailure,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::ContainerCreated
            | AuditEventType::ContainerStarted
            | AuditEventType::ContainerStopped
            | AuditEventType::ContainerRemoved
            | AuditEventType::LimitsUpdated
            | AuditEventType::ContainerImported => AuditSeverity::Low,

            AuditEventType::ContainerExited
            | AuditEventType::RestartScheduled
            | AuditEventType::StateRecovered
            | AuditEventType::ForcedKill => AuditSeverity::Medium,

            AuditEventType::StartFailed
            | AuditEventType::ContainerFailed
            | AuditEventType::ResourceLimitViolation => AuditSeverity::High,

            AuditEventType::CleanupFailure => AuditSeverity::Critical,
        }
    }
}

/// Individual audit event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub container_id: Option<String>,
    pub name: Option<String>,
    pub details: String,
    /// Engine process that emitted the event
    pub engine_pid: u32,
}

impl AuditEvent {
    /// Create a new event with default severity
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            container_id: None,
            name: None,
            details: details.into(),
            engine_pid: std::process::id(),
        }
    }

    /// Event about a specific container
    pub fn for_container(
        event_type: AuditEventType,
        container: &Container,
        details: impl Into<String>,
    ) -> Self {
        Self::new(event_type, details).with_container(container)
    }

    pub fn with_container(mut self, container: &Container) -> Self {
        self.container_id = Some(container.id.clone());
        self.name = Some(container.name.clone());
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Appends audit events to a JSON-lines file
pub struct AuditLog {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl AuditLog {
    pub fn open(audit_path: &Path) -> Result<Self> {
        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .map_err(|e| {
                EngineError::Persistence(format!(
                    "Failed to open audit log {}: {}",
                    audit_path.display(),
                    e
                ))
            })?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path: audit_path.to_path_buf(),
        })
    }

    /// Record an event; failures to write are logged, never propagated
    pub fn record(&self, event: AuditEvent) {
        let subject = event
            .name
            .as_deref()
            .or(event.container_id.as_deref())
            .unwrap_or("-");

        match event.severity {
            AuditSeverity::Critical | AuditSeverity::High => {
                error!("{:?} [{}]: {}", event.event_type, subject, event.details)
            }
            AuditSeverity::Medium => {
                warn!("{:?} [{}]: {}", event.event_type, subject, event.details)
            }
            AuditSeverity::Low => {
                info!("{:?} [{}]: {}", event.event_type, subject, event.details)
            }
        }

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    error!("Failed to write to audit log: {}", e);
                }
            }
            Err(_) => error!("Audit log mutex poisoned"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }

    /// Read back all events; used by tests and diagnostics
    pub fn read_events(&self) -> Result<Vec<AuditEvent>> {
        let content = std::fs::read_to_string(&self.audit_path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(EngineError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ContainerSpec;

    #[test]
    fn test_events_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.jsonl")).unwrap();
        let container = Container::from_spec(ContainerSpec::new("bot", "/bin/true"));

        log.record(AuditEvent::for_container(
            AuditEventType::ContainerCreated,
            &container,
            "created",
        ));
        log.record(
            AuditEvent::new(AuditEventType::StateRecovered, "recovery pass")
                .with_severity(AuditSeverity::Low),
        );

        let events = log.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].container_id.as_deref(), Some(container.id.as_str()));
        assert_eq!(events[0].severity, AuditSeverity::Low);
        assert_eq!(events[1].severity, AuditSeverity::Low);
        assert!(events[1].container_id.is_none());
    }

    #[test]
    fn test_failure_events_are_high_severity() {
        assert_eq!(
            AuditEventType::ContainerFailed.default_severity(),
            AuditSeverity::High
        );
        assert_eq!(
            AuditEventType::CleanupFailure.default_severity(),
            AuditSeverity::Critical
        );
    }
}
