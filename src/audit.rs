/// Audit logging for gateway and rule file operations
///
/// This module provides structured logging of every operation that changes
/// the gateway or a rule file: reconciliation passes, rule removals, loads
/// and saves. Logging is opt-in via `enable_event_log` in the config.
use crate::core::engine::PassSummary;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ReconcileRules,
    RemoveRule,
    LoadRules,
    SaveRules,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let state_dir = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;

        Ok(Self::at(state_dir.join("audit.log")))
    }

    /// Creates an audit log at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn write_event(enabled: bool, event: AuditEvent) {
    if !enabled {
        return;
    }
    if let Ok(audit) = AuditLog::new()
        && let Err(e) = audit.log(event).await
    {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}

/// Builds the event for a finished reconciliation pass
pub fn reconcile_event(summary: &PassSummary) -> AuditEvent {
    AuditEvent::new(
        EventType::ReconcileRules,
        summary.failed == 0,
        serde_json::json!({
            "forwarded": summary.forwarded,
            "closed": summary.closed,
            "failed": summary.failed,
            "skipped": summary.skipped,
        }),
        None,
    )
}

/// Logs a finished reconciliation pass
pub async fn log_reconcile(enabled: bool, summary: &PassSummary) {
    write_event(enabled, reconcile_event(summary)).await;
}

/// Logs a rule removal and its best-effort gateway close
pub async fn log_remove(enabled: bool, mapping: Option<String>, error: Option<String>) {
    let event = AuditEvent::new(
        EventType::RemoveRule,
        error.is_none(),
        serde_json::json!({ "mapping": mapping }),
        error,
    );
    write_event(enabled, event).await;
}

/// Logs a rule file load
pub async fn log_load(enabled: bool, path: &Path, rule_count: usize, error: Option<String>) {
    let event = AuditEvent::new(
        EventType::LoadRules,
        error.is_none(),
        serde_json::json!({ "path": path.display().to_string(), "rule_count": rule_count }),
        error,
    );
    write_event(enabled, event).await;
}

/// Logs a rule file save
pub async fn log_save(enabled: bool, path: &Path, rule_count: usize, error: Option<String>) {
    let event = AuditEvent::new(
        EventType::SaveRules,
        error.is_none(),
        serde_json::json!({ "path": path.display().to_string(), "rule_count": rule_count }),
        error,
    );
    write_event(enabled, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_event_details() {
        let summary = PassSummary {
            forwarded: 3,
            closed: 1,
            failed: 1,
            skipped: 0,
        };
        let event = reconcile_event(&summary);

        assert!(!event.success);
        assert_eq!(event.event_type, EventType::ReconcileRules);
        assert_eq!(event.details["forwarded"], 3);
        assert_eq!(event.details["failed"], 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::RemoveRule,
            false,
            serde_json::json!({"mapping": "8080/TCP"}),
            Some("gateway unreachable".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("remove_rule"));
        assert!(json.contains("gateway unreachable"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"save_rules","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::SaveRules);
    }

    #[tokio::test]
    async fn test_log_and_read_recent() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        audit
            .log(reconcile_event(&PassSummary::default()))
            .await
            .unwrap();
        audit
            .log(AuditEvent::new(
                EventType::LoadRules,
                true,
                serde_json::json!({"rule_count": 2}),
                None,
            ))
            .await
            .unwrap();

        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::LoadRules);
        assert_eq!(events[1].event_type, EventType::ReconcileRules);

        let latest = audit.read_recent(1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(audit.path(), dir.path().join("audit.log"));
    }
}
