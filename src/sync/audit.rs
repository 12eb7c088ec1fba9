use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::state::SyncPhase;
use super::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Phase,
    Operation,
    Warning,
    Conflict,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub phase: SyncPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub message: String,
    pub success: bool,
}

/// Everything that happened during one session, in order.
///
/// Errors are recorded before they propagate so the trail survives a fatal
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub session_id: String,
    pub epic_key: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new(session_id: &str, epic_key: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            epic_key: epic_key.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            entries: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        kind: AuditKind,
        phase: SyncPhase,
        target: Option<&str>,
        message: impl Into<String>,
        success: bool,
    ) {
        self.entries.push(AuditEntry {
            timestamp: Utc::now(),
            kind,
            phase,
            target: target.map(str::to_string),
            message: message.into(),
            success,
        });
    }

    pub fn phase(&mut self, phase: SyncPhase) {
        self.record(AuditKind::Phase, phase, None, format!("entered {phase}"), true);
    }

    pub fn error(&mut self, phase: SyncPhase, target: Option<&str>, message: impl Into<String>) {
        self.record(AuditKind::Error, phase, target, message, false);
    }

    pub fn errors(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(|e| !e.success)
    }

    pub fn file_path(&self, audit_dir: &Path) -> PathBuf {
        audit_dir.join(format!("{}.json", self.session_id))
    }

    /// Stamp the finish time and write `<audit_dir>/<session_id>.json`.
    pub fn save(&mut self, audit_dir: &Path) -> Result<PathBuf> {
        self.finished_at = Some(Utc::now());
        let path = self.file_path(audit_dir);
        write_json_atomic(&path, self)
            .with_context(|| format!("Failed to save audit trail {}", self.session_id))?;
        Ok(path)
    }

    pub fn load(audit_dir: &Path, session_id: &str) -> Result<Option<Self>> {
        read_json(&audit_dir.join(format!("{session_id}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_trail_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut trail = AuditTrail::new("sync-abc", "PROJ-1");
        trail.phase(SyncPhase::Analyzing);
        trail.error(SyncPhase::Executing, Some("TEST-1"), "resource not found");

        let path = trail.save(dir.path()).unwrap();
        assert!(path.ends_with("sync-abc.json"));

        let loaded = AuditTrail::load(dir.path(), "sync-abc").unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.errors().count(), 1);
        assert!(loaded.finished_at.is_some());
    }
}
