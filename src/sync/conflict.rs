//! Three-way conflict detection between the markdown, the live tracker and
//! the snapshot taken at the end of the previous successful sync.
//!
//! The snapshot is what lets the engine tell "the markdown changed"
//! (expected) apart from "someone edited the tracker directly" (conflict).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::matching::{strip_story_prefix, MatchedPair};
use super::{read_json, sanitize_key, write_json_atomic};
use crate::domain::{Status, StoryId, UserStory};
use crate::ports::{description_to_text, DocumentFormatterPort, IssueData};

/// Which side the sync writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Markdown to tracker
    Push,
    /// Tracker to markdown
    Pull,
}

/// Story fields covered by conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncField {
    Title,
    Description,
    Status,
    StoryPoints,
}

impl SyncField {
    pub const ALL: [SyncField; 4] = [
        SyncField::Title,
        SyncField::Description,
        SyncField::Status,
        SyncField::StoryPoints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncField::Title => "title",
            SyncField::Description => "description",
            SyncField::Status => "status",
            SyncField::StoryPoints => "story_points",
        }
    }
}

impl std::fmt::Display for SyncField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn format_points(points: Option<f64>) -> String {
    points.map(|p| p.to_string()).unwrap_or_default()
}

fn normalize_status(value: &str) -> String {
    match Status::parse(value) {
        Some(status) => status.tracker_name().to_string(),
        None => value.trim().to_string(),
    }
}

/// Comparable value of `field` on the markdown side.
///
/// Descriptions go through the formatter so both sides share one
/// representation.
pub fn markdown_field_value(
    story: &UserStory,
    field: SyncField,
    formatter: &dyn DocumentFormatterPort,
) -> String {
    match field {
        SyncField::Title => story.title.trim().to_string(),
        SyncField::Description => match story.description_markdown() {
            Some(md) => description_to_text(Some(&formatter.format_text(&md))),
            None => String::new(),
        },
        SyncField::Status => story.status.tracker_name().to_string(),
        SyncField::StoryPoints => format_points(story.story_points),
    }
}

/// Comparable value of `field` on the tracker side.
pub fn tracker_field_value(issue: &IssueData, field: SyncField) -> String {
    match field {
        SyncField::Title => strip_story_prefix(&issue.summary).to_string(),
        SyncField::Description => issue.description_text(),
        SyncField::Status => normalize_status(&issue.status),
        SyncField::StoryPoints => format_points(issue.story_points),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub field: SyncField,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub story_id: String,
    pub issue_key: String,
    pub fields: Vec<FieldSnapshot>,
}

impl StorySnapshot {
    pub fn value(&self, field: SyncField) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.field == field)
            .map(|f| f.value.as_str())
    }
}

/// Field values of every synced pair, taken at the end of a successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub epic_key: String,
    pub markdown_path: String,
    pub created_at: DateTime<Utc>,
    pub stories: Vec<StorySnapshot>,
}

impl SyncSnapshot {
    pub fn story(&self, story_id: &str) -> Option<&StorySnapshot> {
        self.stories.iter().find(|s| s.story_id == story_id)
    }

    pub fn field_value(&self, story_id: &str, field: SyncField) -> Option<&str> {
        self.story(story_id).and_then(|s| s.value(field))
    }
}

/// Build the post-sync snapshot.
///
/// Fields in `markdown_side` record the markdown value: either it was
/// written successfully, or a conflict on that field was resolved in the
/// tracker's favour and must surface again while the two sides differ.
/// Every other field keeps the live value read during analysis.
pub fn create_snapshot_from_sync(
    epic_key: &str,
    markdown_path: &Path,
    pairs: &[MatchedPair],
    formatter: &dyn DocumentFormatterPort,
    markdown_side: &HashSet<(StoryId, SyncField)>,
) -> SyncSnapshot {
    let stories = pairs
        .iter()
        .map(|pair| StorySnapshot {
            story_id: pair.story.id.to_string(),
            issue_key: pair.issue.key.clone(),
            fields: SyncField::ALL
                .iter()
                .map(|&field| FieldSnapshot {
                    field,
                    value: if markdown_side.contains(&(pair.story.id.clone(), field)) {
                        markdown_field_value(&pair.story, field, formatter)
                    } else {
                        tracker_field_value(&pair.issue, field)
                    },
                })
                .collect(),
        })
        .collect();

    SyncSnapshot {
        epic_key: epic_key.to_string(),
        markdown_path: markdown_path.display().to_string(),
        created_at: Utc::now(),
        stories,
    }
}

/// Persists one [`SyncSnapshot`] per epic.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, epic_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(epic_key)))
    }

    pub fn load(&self, epic_key: &str) -> Result<Option<SyncSnapshot>> {
        read_json(&self.file_for(epic_key))
            .with_context(|| format!("Failed to load sync snapshot for {epic_key}"))
    }

    /// Replace the epic's snapshot atomically.
    pub fn save(&self, snapshot: &SyncSnapshot) -> Result<()> {
        write_json_atomic(&self.file_for(&snapshot.epic_key), snapshot)?;
        log::debug!(
            "Saved sync snapshot for {} ({} stories)",
            snapshot.epic_key,
            snapshot.stories.len()
        );
        Ok(())
    }

    /// Snapshot value addressed by `(epic_key, story_id, field)`.
    pub fn get_field(
        &self,
        epic_key: &str,
        story_id: &str,
        field: SyncField,
    ) -> Result<Option<String>> {
        Ok(self
            .load(epic_key)?
            .and_then(|s| s.field_value(story_id, field).map(str::to_string)))
    }

    pub fn delete(&self, epic_key: &str) -> Result<bool> {
        let path = self.file_for(epic_key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Only the tracker moved away from the snapshot
    TrackerModified,
    /// Only the markdown moved away from the snapshot (pull direction)
    MarkdownModified,
    /// Both sides changed, to different values
    BothModified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub story_id: String,
    pub issue_key: String,
    pub field: SyncField,
    pub markdown_value: String,
    pub tracker_value: String,
    pub snapshot_value: String,
    pub conflict_type: ConflictType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_updated_at: Option<DateTime<Utc>>,
}

impl Conflict {
    pub fn description(&self) -> String {
        format!(
            "{} ({}) field '{}': markdown='{}', tracker='{}', last synced='{}'",
            self.story_id,
            self.issue_key,
            self.field,
            truncate(&self.markdown_value),
            truncate(&self.tracker_value),
            truncate(&self.snapshot_value)
        )
    }
}

fn truncate(value: &str) -> String {
    const MAX: usize = 60;
    if value.chars().count() <= MAX {
        value.to_string()
    } else {
        format!("{}...", value.chars().take(MAX).collect::<String>())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub epic_key: String,
    pub direction: SyncDirection,
    pub stories_checked: usize,
    pub fields_checked: usize,
    pub conflicts: Vec<Conflict>,
}

impl ConflictReport {
    pub fn new(epic_key: &str, direction: SyncDirection) -> Self {
        Self {
            epic_key: epic_key.to_string(),
            direction,
            stories_checked: 0,
            fields_checked: 0,
            conflicts: Vec::new(),
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    pub fn conflicts_for(&self, story_id: &str) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| c.story_id == story_id)
            .collect()
    }
}

/// Three-way rule for a single field.
///
/// Push: the tracker must have left the snapshot value and the markdown
/// must disagree with it. Pull mirrors this with the markdown as the
/// externally edited side. One side changing alone, or both converging on
/// the same value, is not a conflict.
pub fn classify(
    direction: SyncDirection,
    markdown: &str,
    tracker: &str,
    snapshot: &str,
) -> Option<ConflictType> {
    if markdown == tracker {
        return None;
    }
    match direction {
        SyncDirection::Push if tracker != snapshot => Some(if markdown == snapshot {
            ConflictType::TrackerModified
        } else {
            ConflictType::BothModified
        }),
        SyncDirection::Pull if markdown != snapshot => Some(if tracker == snapshot {
            ConflictType::MarkdownModified
        } else {
            ConflictType::BothModified
        }),
        _ => None,
    }
}

pub struct ConflictDetector {
    direction: SyncDirection,
}

impl ConflictDetector {
    pub fn new(direction: SyncDirection) -> Self {
        Self { direction }
    }

    /// Compare every matched pair against the stored snapshot.
    ///
    /// Pairs without a snapshot entry (new since the last sync) are never
    /// in conflict.
    pub fn detect(
        &self,
        epic_key: &str,
        snapshot: &SyncSnapshot,
        pairs: &[MatchedPair],
        formatter: &dyn DocumentFormatterPort,
    ) -> ConflictReport {
        let mut report = ConflictReport::new(epic_key, self.direction);

        for pair in pairs {
            let Some(previous) = snapshot.story(pair.story.id.as_str()) else {
                continue;
            };
            report.stories_checked += 1;

            for field in SyncField::ALL {
                let Some(snapshot_value) = previous.value(field) else {
                    continue;
                };
                report.fields_checked += 1;

                let markdown_value = markdown_field_value(&pair.story, field, formatter);
                let tracker_value = tracker_field_value(&pair.issue, field);

                if let Some(conflict_type) =
                    classify(self.direction, &markdown_value, &tracker_value, snapshot_value)
                {
                    let conflict = Conflict {
                        story_id: pair.story.id.to_string(),
                        issue_key: pair.issue.key.clone(),
                        field,
                        markdown_value,
                        tracker_value,
                        snapshot_value: snapshot_value.to_string(),
                        conflict_type,
                        tracker_updated_at: pair.issue.updated_at,
                    };
                    log::warn!("Conflict detected: {}", conflict.description());
                    report.conflicts.push(conflict);
                }
            }
        }

        report
    }
}

/// How conflicts are settled. Chosen by the caller, never inferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The markdown always wins
    #[default]
    PreferMarkdown,
    /// Leave the tracker value in place and skip the field
    PreferTracker,
    /// Abort before any mutation and surface the conflicts
    Manual,
    /// The side modified most recently wins
    NewestWins,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::PreferMarkdown => "prefer_markdown",
            ResolutionStrategy::PreferTracker => "prefer_tracker",
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::NewestWins => "newest_wins",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    UseMarkdown,
    UseTracker,
    /// Left for the operator
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict: Conflict,
    pub resolution: Resolution,
    pub reason: String,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// One resolution per conflict in the report; none is ever dropped.
    ///
    /// `markdown_modified_at` is the document's modification time, used by
    /// [`ResolutionStrategy::NewestWins`] against each issue's `updated_at`.
    /// When either timestamp is unknown the tracker value is kept.
    pub fn resolve(
        report: &ConflictReport,
        strategy: ResolutionStrategy,
        markdown_modified_at: Option<DateTime<Utc>>,
    ) -> Vec<ConflictResolution> {
        report
            .conflicts
            .iter()
            .map(|conflict| {
                let (resolution, reason) = match strategy {
                    ResolutionStrategy::PreferMarkdown => {
                        (Resolution::UseMarkdown, "markdown preferred".to_string())
                    }
                    ResolutionStrategy::PreferTracker => {
                        (Resolution::UseTracker, "tracker preferred".to_string())
                    }
                    ResolutionStrategy::Manual => {
                        (Resolution::Unresolved, "manual resolution required".to_string())
                    }
                    ResolutionStrategy::NewestWins => {
                        match (markdown_modified_at, conflict.tracker_updated_at) {
                            (Some(md), Some(tr)) if md > tr => (
                                Resolution::UseMarkdown,
                                format!("markdown modified {md} after tracker {tr}"),
                            ),
                            (Some(md), Some(tr)) => (
                                Resolution::UseTracker,
                                format!("tracker modified {tr} not before markdown {md}"),
                            ),
                            _ => {
                                log::warn!(
                                    "No timestamps to compare for {} field '{}'; keeping tracker value",
                                    conflict.story_id,
                                    conflict.field
                                );
                                (
                                    Resolution::UseTracker,
                                    "modification time unknown; tracker kept".to_string(),
                                )
                            }
                        }
                    }
                };
                ConflictResolution {
                    conflict: conflict.clone(),
                    resolution,
                    reason,
                }
            })
            .collect()
    }

    /// Fields that must not be pushed: resolved for the tracker or left open.
    pub fn fields_to_skip(resolutions: &[ConflictResolution]) -> HashSet<(String, SyncField)> {
        resolutions
            .iter()
            .filter(|r| r.resolution != Resolution::UseMarkdown)
            .map(|r| (r.conflict.story_id.clone(), r.conflict.field))
            .collect()
    }
}
