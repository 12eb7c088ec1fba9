//! Field-level differences, for change reports and for comparing a backup
//! against the tracker as it is now.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::backup::{Backup, IssueSnapshot};
use super::conflict::{tracker_field_value, StorySnapshot, SyncField};
use crate::ports::{description_to_text, statuses_equivalent, IssueData};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub old: String,
    pub new: String,
}

impl FieldDiff {
    fn new(field: &str, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            old: old.into(),
            new: new.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDiff {
    pub issue_key: String,
    pub summary: String,
    pub field_diffs: Vec<FieldDiff>,
    /// Per-subtask differences; subtasks with no change are omitted
    #[serde(default)]
    pub subtask_diffs: Vec<IssueDiff>,
}

impl IssueDiff {
    pub fn has_changes(&self) -> bool {
        !self.field_diffs.is_empty() || self.subtask_diffs.iter().any(IssueDiff::has_changes)
    }

    pub fn change_count(&self) -> usize {
        self.field_diffs.len()
            + self
                .subtask_diffs
                .iter()
                .map(IssueDiff::change_count)
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub epic_key: String,
    pub backup_id: Option<String>,
    pub issue_diffs: Vec<IssueDiff>,
    /// Issues present now but absent from the baseline
    pub added_keys: Vec<String>,
    /// Issues in the baseline that no longer exist
    pub removed_keys: Vec<String>,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !self.issue_diffs.is_empty() || !self.added_keys.is_empty() || !self.removed_keys.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.issue_diffs
            .iter()
            .map(IssueDiff::change_count)
            .sum::<usize>()
            + self.added_keys.len()
            + self.removed_keys.len()
    }
}

fn points(value: Option<f64>) -> String {
    value.map(|p| p.to_string()).unwrap_or_default()
}

pub struct DiffCalculator;

impl DiffCalculator {
    /// Differences between the last synced values of a story and the issue
    /// as it is now. Identical inputs always produce an empty list.
    pub fn diff_story(before: &StorySnapshot, now: &IssueData) -> Vec<FieldDiff> {
        SyncField::ALL
            .iter()
            .filter_map(|&field| {
                let old = before.value(field)?;
                let new = tracker_field_value(now, field);
                (old != new).then(|| FieldDiff::new(field.as_str(), old, new))
            })
            .collect()
    }

    /// Differences between a backed-up issue and its live counterpart,
    /// subtasks included.
    pub fn diff_issue(before: &IssueSnapshot, now: &IssueData) -> IssueDiff {
        let mut field_diffs = Vec::new();

        if before.summary.trim() != now.summary.trim() {
            field_diffs.push(FieldDiff::new("summary", &before.summary, &now.summary));
        }
        let old_desc = description_to_text(before.description.as_ref());
        let new_desc = now.description_text();
        if old_desc != new_desc {
            field_diffs.push(FieldDiff::new("description", old_desc, new_desc));
        }
        if !statuses_equivalent(&before.status, &now.status) {
            field_diffs.push(FieldDiff::new("status", &before.status, &now.status));
        }
        if before.story_points != now.story_points {
            field_diffs.push(FieldDiff::new(
                "story_points",
                points(before.story_points),
                points(now.story_points),
            ));
        }
        if before.assignee != now.assignee {
            field_diffs.push(FieldDiff::new(
                "assignee",
                before.assignee.clone().unwrap_or_default(),
                now.assignee.clone().unwrap_or_default(),
            ));
        }

        let live: HashMap<&str, &IssueData> =
            now.subtasks.iter().map(|s| (s.key.as_str(), s)).collect();
        let mut subtask_diffs = Vec::new();
        for sub in &before.subtasks {
            match live.get(sub.key.as_str()) {
                Some(current) => {
                    let diff = Self::diff_issue(sub, current);
                    if diff.has_changes() {
                        subtask_diffs.push(diff);
                    }
                }
                None => field_diffs.push(FieldDiff::new("subtask_removed", &sub.key, "")),
            }
        }
        for current in &now.subtasks {
            if !before.subtasks.iter().any(|s| s.key == current.key) {
                field_diffs.push(FieldDiff::new("subtask_added", "", &current.key));
            }
        }

        IssueDiff {
            issue_key: now.key.clone(),
            summary: now.summary.clone(),
            field_diffs,
            subtask_diffs,
        }
    }
}

/// Compare a backup with the tracker's current state.
pub fn compare_backup_to_current(backup: &Backup, current: &[IssueData]) -> DiffResult {
    let live: HashMap<&str, &IssueData> = current.iter().map(|i| (i.key.as_str(), i)).collect();
    let mut result = DiffResult {
        epic_key: backup.epic_key.clone(),
        backup_id: Some(backup.backup_id.clone()),
        ..DiffResult::default()
    };

    for snapshot in &backup.issues {
        match live.get(snapshot.key.as_str()) {
            Some(issue) => {
                let diff = DiffCalculator::diff_issue(snapshot, issue);
                if diff.has_changes() {
                    result.issue_diffs.push(diff);
                }
            }
            None => result.removed_keys.push(snapshot.key.clone()),
        }
    }
    for issue in current {
        if backup.get_issue(&issue.key).is_none() {
            result.added_keys.push(issue.key.clone());
        }
    }

    result
}
