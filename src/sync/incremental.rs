//! Fingerprint-based change detection for incremental sync.
//!
//! A story whose fingerprint matches the one recorded after the last
//! successful sync is skipped entirely: no commands are built for it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{read_json, sanitize_key, sha256_hex, write_json_atomic};
use crate::domain::{StoryId, UserStory};

/// Field separator for the canonical encoding; never appears in markdown.
const SEP: char = '\u{1f}';

/// Stable hash over the fields that drive sync decisions.
///
/// Covers title, description markdown, status, story points and the
/// subtask set (sorted by name, so reordering subtasks in the document is
/// not a change). Volatile data such as timestamps is excluded.
pub fn compute_story_hash(story: &UserStory) -> String {
    let mut canonical = String::new();
    let mut push = |value: &str| {
        canonical.push_str(value);
        canonical.push(SEP);
    };

    push(story.title.trim());
    push(story.description_markdown().unwrap_or_default().trim());
    push(story.status.tracker_name());
    push(&format_points(story.story_points));

    let mut subtasks: Vec<_> = story.subtasks.iter().collect();
    subtasks.sort_by(|a, b| a.name.trim().cmp(b.name.trim()));
    for subtask in subtasks {
        push(subtask.name.trim());
        push(subtask.description.trim());
        push(&format_points(subtask.story_points));
        push(if subtask.completed { "1" } else { "0" });
    }

    sha256_hex(canonical.as_bytes())
}

fn format_points(points: Option<f64>) -> String {
    points.map(|p| p.to_string()).unwrap_or_default()
}

/// True when the two stories would lead to different sync work.
pub fn stories_differ(a: &UserStory, b: &UserStory) -> bool {
    compute_story_hash(a) != compute_story_hash(b)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryFingerprint {
    pub story_id: String,
    pub hash: String,
    pub synced_at: DateTime<Utc>,
}

impl StoryFingerprint {
    pub fn of(story: &UserStory) -> Self {
        Self {
            story_id: story.id.to_string(),
            hash: compute_story_hash(story),
            synced_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalSyncStats {
    pub total_stories: usize,
    pub changed_stories: usize,
    pub skipped_stories: usize,
}

impl IncrementalSyncStats {
    /// Share of stories skipped, in percent.
    pub fn skip_rate(&self) -> f64 {
        if self.total_stories == 0 {
            0.0
        } else {
            self.skipped_stories as f64 * 100.0 / self.total_stories as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeDetectionResult {
    /// New or modified since the last recorded sync
    pub changed: Vec<StoryId>,
    pub unchanged: Vec<StoryId>,
}

impl ChangeDetectionResult {
    pub fn is_changed(&self, id: &StoryId) -> bool {
        self.changed.contains(id)
    }

    pub fn stats(&self) -> IncrementalSyncStats {
        IncrementalSyncStats {
            total_stories: self.changed.len() + self.unchanged.len(),
            changed_stories: self.changed.len(),
            skipped_stories: self.unchanged.len(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FingerprintFile {
    epic_key: String,
    fingerprints: BTreeMap<String, StoryFingerprint>,
}

/// Persists story fingerprints, one JSON document per epic.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    dir: PathBuf,
}

impl ChangeTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, epic_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(epic_key)))
    }

    /// Fingerprints recorded for an epic, keyed by story ID.
    pub fn load(&self, epic_key: &str) -> Result<BTreeMap<String, StoryFingerprint>> {
        let file: Option<FingerprintFile> = read_json(&self.file_for(epic_key))?;
        Ok(file.map(|f| f.fingerprints).unwrap_or_default())
    }

    pub fn detect_changes(
        &self,
        epic_key: &str,
        stories: &[UserStory],
    ) -> Result<ChangeDetectionResult> {
        let recorded = self.load(epic_key)?;
        let mut result = ChangeDetectionResult::default();

        for story in stories {
            let unchanged = recorded
                .get(story.id.as_str())
                .is_some_and(|fp| fp.hash == compute_story_hash(story));
            if unchanged {
                result.unchanged.push(story.id.clone());
            } else {
                result.changed.push(story.id.clone());
            }
        }

        log::debug!(
            "Incremental check for {}: {} changed, {} unchanged",
            epic_key,
            result.changed.len(),
            result.unchanged.len()
        );
        Ok(result)
    }

    /// Record fingerprints for stories that synced cleanly.
    pub fn record_synced(&self, epic_key: &str, stories: &[&UserStory]) -> Result<()> {
        if stories.is_empty() {
            return Ok(());
        }

        let mut fingerprints = self.load(epic_key)?;
        for story in stories {
            fingerprints.insert(story.id.to_string(), StoryFingerprint::of(story));
        }

        let file = FingerprintFile {
            epic_key: epic_key.to_string(),
            fingerprints,
        };
        write_json_atomic(&self.file_for(epic_key), &file)
            .with_context(|| format!("Failed to save fingerprints for {epic_key}"))
    }

    /// Forget everything recorded for an epic, forcing a full sync next time.
    pub fn clear(&self, epic_key: &str) -> Result<()> {
        let path = self.file_for(epic_key);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Status, Subtask};
    use tempfile::TempDir;

    fn story() -> UserStory {
        let mut s = UserStory::new(StoryId::parse("US-001").unwrap(), "Alpha");
        s.story_points = Some(3.0);
        s.subtasks.push(Subtask::new("b").with_points(1.0));
        s.subtasks.push(Subtask::new("a"));
        s
    }

    #[test]
    fn test_hash_is_stable_and_order_insensitive_for_subtasks() {
        let a = story();
        let mut b = story();
        b.subtasks.reverse();
        assert_eq!(compute_story_hash(&a), compute_story_hash(&b));
        assert_eq!(compute_story_hash(&a).len(), 64);
        assert!(!stories_differ(&a, &b));
    }

    #[test]
    fn test_hash_changes_with_sync_fields() {
        let base = compute_story_hash(&story());

        let mut s = story();
        s.status = Status::Done;
        assert_ne!(compute_story_hash(&s), base);

        let mut s = story();
        s.subtasks[0].completed = true;
        assert_ne!(compute_story_hash(&s), base);

        let mut s = story();
        s.story_points = None;
        assert_ne!(compute_story_hash(&s), base);
    }

    #[test]
    fn test_change_tracker_round_trip() {
        let dir = TempDir::new().unwrap();
        let tracker = ChangeTracker::new(dir.path());
        let alpha = story();
        let mut beta = UserStory::new(StoryId::parse("US-002").unwrap(), "Beta");

        let first = tracker.detect_changes("PROJ-1", &[alpha.clone(), beta.clone()]).unwrap();
        assert_eq!(first.changed.len(), 2);

        tracker.record_synced("PROJ-1", &[&alpha, &beta]).unwrap();
        beta.title = "Beta v2".into();

        let second = tracker.detect_changes("PROJ-1", &[alpha.clone(), beta.clone()]).unwrap();
        assert_eq!(second.unchanged, vec![alpha.id.clone()]);
        assert!(second.is_changed(&beta.id));

        let stats = second.stats();
        assert_eq!(stats.total_stories, 2);
        assert_eq!(stats.skipped_stories, 1);
        assert_eq!(stats.skip_rate(), 50.0);

        tracker.clear("PROJ-1").unwrap();
        assert!(tracker.load("PROJ-1").unwrap().is_empty());
    }
}
