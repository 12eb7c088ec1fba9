use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::commands::CommandKind;
use super::{read_json, write_json_atomic};
use crate::history::days_before;

/// Phase of a sync session.
///
/// Phases only move forward. `Completed`, `Failed` and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Analyzing,
    BackingUp,
    Diffing,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Analyzing => "analyzing",
            SyncPhase::BackingUp => "backing_up",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Executing => "executing",
            SyncPhase::Completed => "completed",
            SyncPhase::Failed => "failed",
            SyncPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Completed | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            SyncPhase::Analyzing => 0,
            SyncPhase::BackingUp => 1,
            SyncPhase::Diffing => 2,
            SyncPhase::Executing => 3,
            SyncPhase::Completed | SyncPhase::Failed | SyncPhase::Cancelled => 4,
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Completed,
    Failed,
    Skipped,
}

/// One executed (or skipped) command, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub operation_type: CommandKind,
    pub target_key: String,
    pub status: OperationStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persistent record of one sync session.
///
/// Saved after every recorded operation so an interrupted run can report
/// exactly which operations completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub session_id: String,
    pub epic_key: String,
    pub markdown_path: String,
    pub phase: SyncPhase,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub operations: Vec<OperationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncState {
    pub fn new(epic_key: &str, markdown_path: &Path, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("sync-{}", &Uuid::new_v4().simple().to_string()[..12]),
            epic_key: epic_key.to_string(),
            markdown_path: markdown_path.display().to_string(),
            phase: SyncPhase::Analyzing,
            dry_run,
            started_at: now,
            updated_at: now,
            backup_id: None,
            operations: Vec::new(),
            error: None,
        }
    }

    /// Move to `next`.
    ///
    /// Re-entering the current phase is a no-op. Going back, or leaving a
    /// terminal phase, is an error. A resumed session re-enters `Executing`
    /// through [`SyncState::resume`] instead.
    pub fn advance(&mut self, next: SyncPhase) -> Result<()> {
        if next == self.phase {
            return Ok(());
        }
        if self.phase.is_terminal() {
            return Err(anyhow!(
                "Session {} is already {}; cannot move to {}",
                self.session_id,
                self.phase,
                next
            ));
        }
        if next.rank() < self.phase.rank() {
            return Err(anyhow!(
                "Session {} cannot move back from {} to {}",
                self.session_id,
                self.phase,
                next
            ));
        }

        log::info!("Sync {} [{}]: {} -> {}", self.session_id, self.epic_key, self.phase, next);
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Re-enter `Executing` for an interrupted, non-terminal session.
    pub fn resume(&mut self) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(anyhow!(
                "Session {} is {} and cannot be resumed",
                self.session_id,
                self.phase
            ));
        }
        log::info!(
            "Resuming sync {} with {} completed operation(s)",
            self.session_id,
            self.completed_operations().count()
        );
        self.phase = SyncPhase::Executing;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record(
        &mut self,
        operation_id: &str,
        operation_type: CommandKind,
        target_key: &str,
        status: OperationStatus,
        error: Option<String>,
    ) {
        let now = Utc::now();
        self.operations.push(OperationRecord {
            operation_id: operation_id.to_string(),
            operation_type,
            target_key: target_key.to_string(),
            status,
            timestamp: now,
            error,
        });
        self.updated_at = now;
    }

    pub fn completed_operations(&self) -> impl Iterator<Item = &OperationRecord> {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Completed)
    }

    pub fn is_completed(&self, operation_id: &str) -> bool {
        self.completed_operations()
            .any(|op| op.operation_id == operation_id)
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.phase = SyncPhase::Failed;
        self.updated_at = Utc::now();
    }
}

/// Stores one JSON document per session under `<state_dir>/sessions`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("sessions"),
        }
    }

    fn file_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Replace the session document atomically.
    pub fn save(&self, state: &SyncState) -> Result<()> {
        write_json_atomic(&self.file_for(&state.session_id), state)
            .with_context(|| format!("Failed to save sync state {}", state.session_id))
    }

    pub fn load(&self, session_id: &str) -> Result<Option<SyncState>> {
        read_json(&self.file_for(session_id))
    }

    /// All sessions, newest first, optionally for one epic.
    pub fn list(&self, epic_key: Option<&str>) -> Result<Vec<SyncState>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match read_json::<SyncState>(&path) {
                Ok(Some(state)) => {
                    if epic_key.map_or(true, |epic| state.epic_key == epic) {
                        sessions.push(state);
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable session {}: {:#}", path.display(), e),
            }
        }

        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    /// Newest interrupted session for an epic.
    pub fn find_resumable(&self, epic_key: &str) -> Result<Option<SyncState>> {
        Ok(self
            .list(Some(epic_key))?
            .into_iter()
            .find(|s| !s.phase.is_terminal()))
    }

    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.file_for(session_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
        Ok(true)
    }

    /// Remove finished sessions older than `max_age_days`.
    pub fn cleanup_completed(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = days_before(Utc::now(), max_age_days)?;
        let mut removed = 0;
        for state in self.list(None)? {
            if state.phase == SyncPhase::Completed && state.updated_at < cutoff {
                if self.delete(&state.session_id)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
