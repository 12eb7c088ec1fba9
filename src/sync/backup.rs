//! Point-in-time backups of tracker state, taken before any mutation.
//!
//! Backups live under `<backup_root>/<epic_key>/<backup_id>.json` and are
//! rotated after each creation: count limit first, then age, and the newest
//! backup of an epic is never removed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{sanitize_key, sha256_hex, write_json_atomic};
use crate::config::BackupSettings;
use crate::history::days_before;
use crate::ports::{description_to_text, IssueData, IssueTrackerPort, SubtaskUpdate};

/// Serializable copy of an issue and its subtask tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub key: String,
    pub summary: String,
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub story_points: Option<f64>,
    #[serde(default)]
    pub subtasks: Vec<IssueSnapshot>,
    #[serde(default)]
    pub comments_count: usize,
    pub captured_at: DateTime<Utc>,
}

impl IssueSnapshot {
    pub fn from_issue(issue: &IssueData, comments_count: usize, captured_at: DateTime<Utc>) -> Self {
        Self {
            key: issue.key.clone(),
            summary: issue.summary.clone(),
            description: issue.description.clone(),
            status: issue.status.clone(),
            issue_type: issue.issue_type.clone(),
            assignee: issue.assignee.clone(),
            story_points: issue.story_points,
            subtasks: issue
                .subtasks
                .iter()
                .map(|s| Self::from_issue(s, 0, captured_at))
                .collect(),
            comments_count,
            captured_at,
        }
    }

    fn descendant_count(&self) -> usize {
        self.subtasks
            .iter()
            .map(|s| 1 + s.descendant_count())
            .sum()
    }

    fn find(&self, key: &str) -> Option<&IssueSnapshot> {
        if self.key == key {
            return Some(self);
        }
        self.subtasks.iter().find_map(|s| s.find(key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub backup_id: String,
    pub epic_key: String,
    pub markdown_path: String,
    pub created_at: DateTime<Utc>,
    /// Per-epic creation counter; orders backups that share a timestamp
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub issues: Vec<IssueSnapshot>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Backup {
    pub fn new(
        epic_key: &str,
        markdown_path: &str,
        sequence: u64,
        issues: Vec<IssueSnapshot>,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            backup_id: generate_backup_id(epic_key, created_at, sequence),
            epic_key: epic_key.to_string(),
            markdown_path: markdown_path.to_string(),
            created_at,
            sequence,
            issues,
            metadata: BTreeMap::new(),
        }
    }

    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    pub fn subtask_count(&self) -> usize {
        self.issues.iter().map(IssueSnapshot::descendant_count).sum()
    }

    /// Find an issue by key, searching subtasks as well.
    pub fn get_issue(&self, key: &str) -> Option<&IssueSnapshot> {
        self.issues.iter().find_map(|i| i.find(key))
    }

    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            backup_id: self.backup_id.clone(),
            epic_key: self.epic_key.clone(),
            markdown_path: self.markdown_path.clone(),
            created_at: self.created_at,
            sequence: self.sequence,
            issue_count: self.issue_count(),
            subtask_count: self.subtask_count(),
        }
    }
}

/// `<epic>_<YYYYmmdd_HHMMSS>_<hash8>`; the hash covers the epic, the exact
/// timestamp and the sequence so two backups in one second never collide.
fn generate_backup_id(epic_key: &str, created_at: DateTime<Utc>, sequence: u64) -> String {
    let seed = format!(
        "{epic_key}:{}:{sequence}:{}",
        created_at.timestamp_nanos_opt().unwrap_or_default(),
        uuid::Uuid::new_v4()
    );
    format!(
        "{}_{}_{}",
        sanitize_key(epic_key),
        created_at.format("%Y%m%d_%H%M%S"),
        &sha256_hex(seed.as_bytes())[..8]
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub backup_id: String,
    pub epic_key: String,
    pub markdown_path: String,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub issue_count: usize,
    pub subtask_count: usize,
}

/// Creates, lists, rotates and loads backups.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    max_backups: usize,
    retention_days: i64,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_settings(root, &BackupSettings::default())
    }

    pub fn from_settings(root: impl Into<PathBuf>, settings: &BackupSettings) -> Self {
        Self {
            root: root.into(),
            max_backups: settings.max_backups.max(1),
            retention_days: settings.retention_days,
        }
    }

    pub fn with_limits(mut self, max_backups: usize, retention_days: i64) -> Self {
        self.max_backups = max_backups.max(1);
        self.retention_days = retention_days;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn epic_dir(&self, epic_key: &str) -> PathBuf {
        self.root.join(sanitize_key(epic_key))
    }

    /// Fetch the epic subtree and back it up.
    pub fn create_backup(
        &self,
        tracker: &dyn IssueTrackerPort,
        epic_key: &str,
        markdown_path: &Path,
    ) -> Result<Backup> {
        let issues = tracker
            .get_epic_children(epic_key)
            .with_context(|| format!("Failed to fetch issues of {epic_key} for backup"))?;
        self.create_backup_from_issues(tracker, epic_key, markdown_path, &issues)
    }

    /// Back up an already fetched subtree. Only comment counts are read from
    /// the tracker; a failed count is logged and recorded as zero.
    pub fn create_backup_from_issues(
        &self,
        tracker: &dyn IssueTrackerPort,
        epic_key: &str,
        markdown_path: &Path,
        issues: &[IssueData],
    ) -> Result<Backup> {
        log::info!("Creating backup for epic {epic_key}");
        let captured_at = Utc::now();

        let snapshots = issues
            .iter()
            .map(|issue| {
                let comments = match tracker.get_issue_comments(&issue.key) {
                    Ok(comments) => comments.len(),
                    Err(e) => {
                        log::warn!("Could not fetch comments for {}: {}", issue.key, e);
                        0
                    }
                };
                IssueSnapshot::from_issue(issue, comments, captured_at)
            })
            .collect();

        let sequence = self.next_sequence(epic_key)?;
        let mut backup = Backup::new(
            epic_key,
            &markdown_path.display().to_string(),
            sequence,
            snapshots,
        );
        backup
            .metadata
            .insert("tracker".to_string(), tracker.name().to_string());

        self.save(&backup)?;
        let removed = self.cleanup(epic_key)?;
        if removed > 0 {
            log::info!("Rotated {removed} old backup(s) for {epic_key}");
        }

        log::info!(
            "Backup created: {} ({} issues, {} subtasks)",
            backup.backup_id,
            backup.issue_count(),
            backup.subtask_count()
        );
        Ok(backup)
    }

    fn next_sequence(&self, epic_key: &str) -> Result<u64> {
        Ok(self
            .list(Some(epic_key))?
            .iter()
            .map(|b| b.sequence)
            .max()
            .map_or(1, |s| s + 1))
    }

    pub fn save(&self, backup: &Backup) -> Result<PathBuf> {
        let path = self
            .epic_dir(&backup.epic_key)
            .join(format!("{}.json", backup.backup_id));
        write_json_atomic(&path, backup)
            .with_context(|| format!("Failed to save backup {}", backup.backup_id))?;
        Ok(path)
    }

    fn backup_files(&self, epic_key: Option<&str>) -> Vec<PathBuf> {
        let dir = match epic_key {
            Some(epic) => self.epic_dir(epic),
            None => self.root.clone(),
        };
        if !dir.exists() {
            return Vec::new();
        }

        WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(if epic_key.is_some() { 1 } else { 2 })
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect()
    }

    fn read_backup(path: &Path) -> Result<Backup> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read backup: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse backup: {}", path.display()))
    }

    /// Backups newest first, optionally restricted to one epic.
    pub fn list(&self, epic_key: Option<&str>) -> Result<Vec<BackupSummary>> {
        let mut summaries: Vec<BackupSummary> = self
            .backup_files(epic_key)
            .iter()
            .filter_map(|path| match Self::read_backup(path) {
                Ok(backup) => Some(backup.summary()),
                Err(e) => {
                    log::warn!("Skipping unreadable backup {}: {:#}", path.display(), e);
                    None
                }
            })
            .collect();

        // Within one epic the sequence is authoritative; across epics only
        // timestamps are comparable.
        if epic_key.is_some() {
            summaries.sort_by(|a, b| {
                b.sequence
                    .cmp(&a.sequence)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            });
        } else {
            summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        Ok(summaries)
    }

    pub fn load(&self, backup_id: &str, epic_key: Option<&str>) -> Result<Option<Backup>> {
        let file_name = format!("{backup_id}.json");
        let found = self
            .backup_files(epic_key)
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == file_name.as_str()));

        match found {
            Some(path) => Ok(Some(Self::read_backup(&path)?)),
            None => {
                log::warn!("Backup not found: {backup_id}");
                Ok(None)
            }
        }
    }

    pub fn latest(&self, epic_key: &str) -> Result<Option<Backup>> {
        match self.list(Some(epic_key))?.first() {
            Some(summary) => self.load(&summary.backup_id, Some(epic_key)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, backup_id: &str, epic_key: Option<&str>) -> Result<bool> {
        let file_name = format!("{backup_id}.json");
        let found = self
            .backup_files(epic_key)
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == file_name.as_str()));

        match found {
            Some(path) => {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete backup: {}", path.display()))?;
                log::info!("Deleted backup: {backup_id}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rotate an epic's backups. Returns how many were deleted.
    ///
    /// Anything beyond `max_backups` (newest first) goes; among the rest,
    /// anything older than `retention_days` goes, except the newest backup.
    pub fn cleanup(&self, epic_key: &str) -> Result<usize> {
        let cutoff = days_before(Utc::now(), self.retention_days)?;
        let backups = self.list(Some(epic_key))?;

        let mut deleted = 0;
        for (idx, backup) in backups.iter().enumerate() {
            let over_limit = idx >= self.max_backups;
            let expired = idx > 0 && backup.created_at < cutoff;
            if !(over_limit || expired) {
                continue;
            }
            log::debug!(
                "Deleting backup {} ({})",
                backup.backup_id,
                if over_limit { "over limit" } else { "expired" }
            );
            if self.delete(&backup.backup_id, Some(epic_key))? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Rotate every epic under the backup root.
    pub fn cleanup_all(&self) -> Result<usize> {
        let epics: BTreeSet<String> = self
            .list(None)?
            .into_iter()
            .map(|b| b.epic_key)
            .collect();

        let mut total = 0;
        for epic in &epics {
            total += self.cleanup(epic)?;
        }
        Ok(total)
    }
}

/// One restore step against one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOperation {
    pub issue_key: String,
    pub field: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub backup_id: String,
    pub dry_run: bool,
    pub operations: Vec<RestoreOperation>,
    pub issues_restored: usize,
    pub issues_skipped: usize,
    pub issues_failed: usize,
}

impl RestoreResult {
    pub fn success(&self) -> bool {
        self.issues_failed == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{}Restore from {}: {} restored, {} unchanged, {} failed",
            if self.dry_run { "[DRY-RUN] " } else { "" },
            self.backup_id,
            self.issues_restored,
            self.issues_skipped,
            self.issues_failed
        )
    }
}

/// Replay a backup's field values through the tracker.
///
/// Best effort per issue: a failure on one issue is recorded and the rest
/// still run. Fields already equal to the snapshot are left alone.
/// `issue_keys` restricts the restore to those issues (subtasks included).
pub fn restore_from_backup(
    tracker: &dyn IssueTrackerPort,
    backup: &Backup,
    dry_run: bool,
    issue_keys: Option<&[String]>,
) -> RestoreResult {
    let mut result = RestoreResult {
        backup_id: backup.backup_id.clone(),
        dry_run,
        ..RestoreResult::default()
    };

    let wanted = |key: &str| issue_keys.map_or(true, |keys| keys.iter().any(|k| k == key));

    for snapshot in &backup.issues {
        if !wanted(&snapshot.key) && !snapshot.subtasks.iter().any(|s| wanted(&s.key)) {
            continue;
        }

        let current = match tracker.get_issue(&snapshot.key) {
            Ok(issue) => issue,
            Err(e) => {
                result.operations.push(RestoreOperation {
                    issue_key: snapshot.key.clone(),
                    field: "fetch".to_string(),
                    success: false,
                    message: e.to_string(),
                });
                result.issues_failed += 1;
                continue;
            }
        };

        let mut ops = Vec::new();
        if wanted(&snapshot.key) {
            restore_description(tracker, snapshot, &current, dry_run, &mut ops);
        }
        for sub in snapshot.subtasks.iter().filter(|s| wanted(&s.key)) {
            match current.subtasks.iter().find(|c| c.key == sub.key) {
                Some(live) => restore_subtask(tracker, sub, live, dry_run, &mut ops),
                None => ops.push(RestoreOperation {
                    issue_key: sub.key.clone(),
                    field: "subtask".to_string(),
                    success: false,
                    message: format!("Subtask {} no longer exists", sub.key),
                }),
            }
        }

        if ops.is_empty() {
            result.issues_skipped += 1;
        } else if ops.iter().all(|op| op.success) {
            result.issues_restored += 1;
        } else {
            result.issues_failed += 1;
        }
        result.operations.extend(ops);
    }

    log::info!("{}", result.summary());
    result
}

fn restore_description(
    tracker: &dyn IssueTrackerPort,
    snapshot: &IssueSnapshot,
    current: &IssueData,
    dry_run: bool,
    ops: &mut Vec<RestoreOperation>,
) {
    let Some(description) = &snapshot.description else {
        return;
    };
    if description_to_text(Some(description)) == current.description_text() {
        return;
    }

    let (success, message) = if dry_run {
        (true, format!("Would restore description of {}", snapshot.key))
    } else {
        match tracker.update_issue_description(&snapshot.key, description) {
            Ok(true) => (true, format!("Restored description of {}", snapshot.key)),
            Ok(false) => (false, format!("Tracker rejected description of {}", snapshot.key)),
            Err(e) => (false, e.to_string()),
        }
    };
    ops.push(RestoreOperation {
        issue_key: snapshot.key.clone(),
        field: "description".to_string(),
        success,
        message,
    });
}

fn restore_subtask(
    tracker: &dyn IssueTrackerPort,
    snapshot: &IssueSnapshot,
    current: &IssueData,
    dry_run: bool,
    ops: &mut Vec<RestoreOperation>,
) {
    let mut update = SubtaskUpdate::default();
    if snapshot.summary != current.summary {
        update.summary = Some(snapshot.summary.clone());
    }
    if snapshot.story_points != current.story_points {
        update.story_points = snapshot.story_points;
    }
    if let Some(description) = &snapshot.description {
        if description_to_text(Some(description)) != current.description_text() {
            update.description = Some(description.clone());
        }
    }
    if update.is_empty() {
        return;
    }

    let (success, message) = if dry_run {
        (true, format!("Would restore subtask {}", snapshot.key))
    } else {
        match tracker.update_subtask(&snapshot.key, &update) {
            Ok(true) => (true, format!("Restored subtask {}", snapshot.key)),
            Ok(false) => (false, format!("Tracker rejected subtask {}", snapshot.key)),
            Err(e) => (false, e.to_string()),
        }
    };
    ops.push(RestoreOperation {
        issue_key: snapshot.key.clone(),
        field: "subtask".to_string(),
        success,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn issue_tree() -> Vec<IssueData> {
        let mut story = IssueData::new("TEST-11", "Story Beta");
        story.subtasks.push(IssueData::new("TEST-12", "Beta Subtask"));
        vec![IssueData::new("TEST-10", "Story Alpha"), story]
    }

    fn backup_with(manager: &BackupManager, epic: &str, sequence: u64) -> Backup {
        let now = Utc::now();
        let issues = issue_tree()
            .iter()
            .map(|i| IssueSnapshot::from_issue(i, 0, now))
            .collect();
        let backup = Backup::new(epic, "stories.md", sequence, issues);
        manager.save(&backup).unwrap();
        backup
    }

    #[test]
    fn test_counts_survive_serialization() {
        let backup = Backup::new(
            "PROJ-1",
            "stories.md",
            1,
            issue_tree()
                .iter()
                .map(|i| IssueSnapshot::from_issue(i, 3, Utc::now()))
                .collect(),
        );
        let json = serde_json::to_string(&backup).unwrap();
        let restored: Backup = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.issue_count(), 2);
        assert_eq!(restored.subtask_count(), 1);
        assert_eq!(restored, backup);
        assert_eq!(restored.get_issue("TEST-12").map(|i| i.summary.as_str()), Some("Beta Subtask"));
    }

    #[test]
    fn test_backup_id_shape() {
        let backup = Backup::new("PROJ-1", "s.md", 1, Vec::new());
        assert!(backup.backup_id.starts_with("PROJ-1_"));
        let hash = backup.backup_id.rsplit('_').next().unwrap();
        assert_eq!(hash.len(), 8);
        assert_ne!(backup.backup_id, Backup::new("PROJ-1", "s.md", 2, Vec::new()).backup_id);
    }

    #[test]
    fn test_list_load_delete() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path());
        let first = backup_with(&manager, "PROJ-1", 1);
        let second = backup_with(&manager, "PROJ-1", 2);
        backup_with(&manager, "PROJ-2", 1);

        let listed = manager.list(Some("PROJ-1")).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].backup_id, second.backup_id);
        assert_eq!(manager.list(None).unwrap().len(), 3);

        assert_eq!(manager.load(&first.backup_id, None).unwrap(), Some(first.clone()));
        assert_eq!(manager.latest("PROJ-1").unwrap().map(|b| b.backup_id), Some(second.backup_id));

        assert!(manager.delete(&first.backup_id, Some("PROJ-1")).unwrap());
        assert!(manager.load(&first.backup_id, Some("PROJ-1")).unwrap().is_none());
    }

    #[test]
    fn test_cleanup_keeps_newest_even_when_expired() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path()).with_limits(5, 1);

        for seq in 1..=3 {
            let mut backup = backup_with(&manager, "PROJ-1", seq);
            backup.created_at = Utc::now() - chrono::Duration::days(10);
            manager.save(&backup).unwrap();
        }

        assert_eq!(manager.cleanup("PROJ-1").unwrap(), 2);
        let left = manager.list(Some("PROJ-1")).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sequence, 3);
    }
}
