//! Pull direction: tracker state flows back into the markdown document.
//!
//! Uses the same matching and snapshot machinery as the push direction.
//! Descriptions are never pulled; rich tracker content does not map back to
//! the document's markdown losslessly.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use super::conflict::{
    create_snapshot_from_sync, ConflictDetector, ConflictReport, ConflictResolver, Resolution,
    ResolutionStrategy, SnapshotStore, SyncDirection, SyncField,
};
use super::matching::{match_subtasks, strip_story_prefix, MatchedPair};
use super::orchestrator::SyncOrchestrator;
use crate::domain::{Status, Subtask, UserStory};
use crate::error::SyncError;
use crate::ports::DocumentWriterPort;

/// One field of one story that the tracker changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeDetail {
    pub story_id: String,
    pub issue_key: String,
    /// `title`, `status`, `story_points`, `subtask_completed` or `subtask_added`
    pub field: String,
    pub old_value: String,
    pub new_value: String,
    /// Subtask the change applies to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask: Option<String>,
}

impl ChangeDetail {
    fn story(pair: &MatchedPair, field: &str, old: String, new: String) -> Self {
        Self {
            story_id: pair.story.id.to_string(),
            issue_key: pair.issue.key.clone(),
            field: field.to_string(),
            old_value: old,
            new_value: new,
            subtask: None,
        }
    }

    fn subtask(pair: &MatchedPair, field: &str, name: &str, old: String, new: String) -> Self {
        Self {
            subtask: Some(name.to_string()),
            ..Self::story(pair, field, old, new)
        }
    }

    pub fn describe(&self) -> String {
        match &self.subtask {
            Some(name) => format!(
                "{} subtask '{}' {}: '{}' -> '{}'",
                self.story_id, name, self.field, self.old_value, self.new_value
            ),
            None => format!(
                "{} {}: '{}' -> '{}'",
                self.story_id, self.field, self.old_value, self.new_value
            ),
        }
    }
}

/// Changes grouped by story, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullChanges {
    pub changes: Vec<ChangeDetail>,
}

impl PullChanges {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn stories_changed(&self) -> usize {
        self.changes
            .iter()
            .map(|c| c.story_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn by_story(&self) -> BTreeMap<&str, Vec<&ChangeDetail>> {
        let mut grouped: BTreeMap<&str, Vec<&ChangeDetail>> = BTreeMap::new();
        for change in &self.changes {
            grouped.entry(change.story_id.as_str()).or_default().push(change);
        }
        grouped
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullResult {
    pub success: bool,
    pub dry_run: bool,
    pub epic_key: String,
    pub markdown_path: PathBuf,
    pub stories_matched: usize,
    pub changes: PullChanges,
    /// Whether the document was rewritten
    pub written: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<ConflictReport>,
    /// Tracker issues with no story in the document
    pub unmatched_tracker: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl PullResult {
    pub fn summary(&self) -> String {
        format!(
            "{}{} stories matched, {} change(s) across {} stories{}",
            if self.dry_run { "[DRY-RUN] " } else { "" },
            self.stories_matched,
            self.changes.len(),
            self.changes.stories_changed(),
            if self.written { ", document updated" } else { "" }
        )
    }
}

/// Pulls tracker-side edits into the markdown document.
pub struct ReverseSyncOrchestrator<'a> {
    inner: SyncOrchestrator<'a>,
    writer: &'a dyn DocumentWriterPort,
    snapshots: Option<SnapshotStore>,
}

impl<'a> ReverseSyncOrchestrator<'a> {
    /// `inner` supplies the tracker, parser, formatter, configuration and
    /// read retries.
    pub fn new(inner: SyncOrchestrator<'a>, writer: &'a dyn DocumentWriterPort) -> Self {
        Self {
            inner,
            writer,
            snapshots: None,
        }
    }

    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn pull(&self, markdown_path: &Path, epic_key: &str) -> Result<PullResult, SyncError> {
        let config = self.inner.config();
        let analysis = self.inner.analyze(markdown_path, epic_key)?;
        log::info!(
            "Pulling {} into {}{}",
            epic_key,
            markdown_path.display(),
            if config.dry_run { " (dry run)" } else { "" }
        );

        let mut result = PullResult {
            success: true,
            dry_run: config.dry_run,
            epic_key: epic_key.to_string(),
            markdown_path: markdown_path.to_path_buf(),
            stories_matched: analysis.matched.len(),
            unmatched_tracker: analysis
                .unmatched_tracker
                .iter()
                .map(|i| i.key.clone())
                .collect(),
            warnings: analysis.warnings.clone(),
            ..PullResult::default()
        };

        let mut keep_markdown: HashSet<(String, SyncField)> = HashSet::new();
        if let Some(store) = &self.snapshots {
            if let Some(snapshot) = store.load(epic_key)? {
                let report = ConflictDetector::new(SyncDirection::Pull).detect(
                    epic_key,
                    &snapshot,
                    &analysis.matched,
                    self.inner.formatter(),
                );
                if report.has_conflicts() {
                    if config.resolution_strategy == ResolutionStrategy::Manual {
                        result.errors.push(format!(
                            "{} conflict(s) need manual resolution; document left unchanged",
                            report.conflict_count()
                        ));
                        result.success = false;
                        result.conflicts = Some(report);
                        return Ok(result);
                    }
                    let modified = std::fs::metadata(markdown_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .map(chrono::DateTime::<chrono::Utc>::from);
                    for resolution in
                        ConflictResolver::resolve(&report, config.resolution_strategy, modified)
                    {
                        if resolution.resolution != Resolution::UseTracker {
                            result.warnings.push(format!(
                                "Kept markdown {} of {} ({})",
                                resolution.conflict.field,
                                resolution.conflict.story_id,
                                resolution.reason
                            ));
                            keep_markdown
                                .insert((resolution.conflict.story_id, resolution.conflict.field));
                        }
                    }
                    result.conflicts = Some(report);
                }
            }
        }

        for pair in &analysis.matched {
            let kept = |field| keep_markdown.contains(&(pair.story.id.to_string(), field));
            result.changes.changes.extend(detect_changes(pair, kept));
        }
        log::info!(
            "{} change(s) pulled from {} for {} stories",
            result.changes.len(),
            epic_key,
            result.changes.stories_changed()
        );

        if config.dry_run || result.changes.is_empty() {
            return Ok(result);
        }

        let mut stories = self.inner.parser().parse_stories(markdown_path)?;
        let pairs: BTreeMap<String, &MatchedPair> = analysis
            .matched
            .iter()
            .map(|p| (p.story.id.to_string(), p))
            .collect();
        for story in &mut stories {
            if let Some(pair) = pairs.get(story.id.as_str()) {
                let changes: Vec<&ChangeDetail> = result
                    .changes
                    .changes
                    .iter()
                    .filter(|c| c.story_id == story.id.as_str())
                    .collect();
                apply_changes(story, pair, &changes);
            }
        }

        match self.writer.write_stories(markdown_path, &stories) {
            Ok(()) => {
                result.written = true;
                log::info!("Updated {}", markdown_path.display());
            }
            Err(e) => {
                log::error!("Could not write {}: {e:#}", markdown_path.display());
                result.errors.push(format!("Could not write document: {e:#}"));
                result.success = false;
                return Ok(result);
            }
        }

        if let Some(store) = &self.snapshots {
            let snapshot = create_snapshot_from_sync(
                epic_key,
                markdown_path,
                &analysis.matched,
                self.inner.formatter(),
                &HashSet::new(),
            );
            if let Err(e) = store.save(&snapshot) {
                result
                    .warnings
                    .push(format!("Could not save conflict snapshot: {e:#}"));
            }
        }

        Ok(result)
    }
}

fn format_points(points: Option<f64>) -> String {
    points.map(|p| p.to_string()).unwrap_or_default()
}

fn detect_changes(pair: &MatchedPair, kept: impl Fn(SyncField) -> bool) -> Vec<ChangeDetail> {
    let story = &pair.story;
    let issue = &pair.issue;
    let mut changes = Vec::new();

    let title = strip_story_prefix(&issue.summary).trim();
    if !title.is_empty() && title != story.title.trim() && !kept(SyncField::Title) {
        changes.push(ChangeDetail::story(
            pair,
            "title",
            story.title.clone(),
            title.to_string(),
        ));
    }

    match Status::parse(&issue.status) {
        Some(status) if status != story.status && !kept(SyncField::Status) => {
            changes.push(ChangeDetail::story(
                pair,
                "status",
                story.status.tracker_name().to_string(),
                status.tracker_name().to_string(),
            ));
        }
        Some(_) => {}
        None => log::warn!(
            "Unknown tracker status '{}' on {}; status not pulled",
            issue.status,
            issue.key
        ),
    }

    if issue.story_points.is_some()
        && issue.story_points != story.story_points
        && !kept(SyncField::StoryPoints)
    {
        changes.push(ChangeDetail::story(
            pair,
            "story_points",
            format_points(story.story_points),
            format_points(issue.story_points),
        ));
    }

    let matched = match_subtasks(&story.subtasks, &issue.subtasks);
    let mut seen = HashSet::new();
    for (idx, live) in &matched {
        let Some(live) = live else { continue };
        seen.insert(live.key.as_str());
        let subtask = &story.subtasks[*idx];
        let done = Status::parse(&live.status).is_some_and(|s| s.is_complete());
        if done != subtask.completed {
            changes.push(ChangeDetail::subtask(
                pair,
                "subtask_completed",
                &subtask.name,
                subtask.completed.to_string(),
                done.to_string(),
            ));
        }
    }
    for live in issue.subtasks.iter().filter(|s| !seen.contains(s.key.as_str())) {
        changes.push(ChangeDetail::subtask(
            pair,
            "subtask_added",
            &live.summary,
            String::new(),
            live.key.clone(),
        ));
    }

    changes
}

fn apply_changes(story: &mut UserStory, pair: &MatchedPair, changes: &[&ChangeDetail]) {
    for change in changes {
        match (change.field.as_str(), change.subtask.as_deref()) {
            ("title", None) => story.title = change.new_value.clone(),
            ("status", None) => {
                if let Some(status) = Status::parse(&change.new_value) {
                    story.status = status;
                }
            }
            ("story_points", None) => story.story_points = pair.issue.story_points,
            ("subtask_completed", Some(name)) => {
                let done = change.new_value == "true";
                if let Some(subtask) = story
                    .subtasks
                    .iter_mut()
                    .find(|s| s.name.trim().eq_ignore_ascii_case(name.trim()))
                {
                    subtask.completed = done;
                }
            }
            ("subtask_added", Some(_)) => {
                if let Some(live) = pair.issue.subtasks.iter().find(|s| s.key == change.new_value) {
                    let mut subtask = Subtask::new(&live.summary);
                    subtask.story_points = live.story_points;
                    subtask.assignee = live.assignee.clone();
                    subtask.completed = Status::parse(&live.status).is_some_and(|s| s.is_complete());
                    story.subtasks.push(subtask);
                }
            }
            (field, _) => log::debug!("Ignoring pulled field {field}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StoryId;
    use crate::ports::IssueData;
    use crate::sync::matching::MatchMethod;

    fn pair() -> MatchedPair {
        let mut story = UserStory::new(StoryId::parse("US-001").unwrap(), "Login");
        story.status = Status::InProgress;
        story.story_points = Some(3.0);
        story.subtasks.push(Subtask::new("Form"));
        story.subtasks.push(Subtask::new("API").completed());

        let mut issue = IssueData::new("PROJ-1", "US-001: Login page");
        issue.status = "Done".to_string();
        issue.story_points = Some(5.0);
        let mut form = IssueData::new("PROJ-2", "form");
        form.status = "Closed".to_string();
        let mut api = IssueData::new("PROJ-3", "API");
        api.status = "Done".to_string();
        let mut docs = IssueData::new("PROJ-4", "Docs");
        docs.status = "To Do".to_string();
        docs.story_points = Some(1.0);
        issue.subtasks = vec![form, api, docs];

        MatchedPair {
            story,
            issue,
            method: MatchMethod::StoryId,
        }
    }

    #[test]
    fn test_detect_changes_covers_every_pulled_field() {
        let pair = pair();
        let changes = detect_changes(&pair, |_| false);
        let fields: Vec<_> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["title", "status", "story_points", "subtask_completed", "subtask_added"]
        );
        assert_eq!(changes[0].new_value, "Login page");
        assert_eq!(changes[1].new_value, "Done");
        assert_eq!(changes[3].subtask.as_deref(), Some("Form"));
        assert_eq!(changes[4].new_value, "PROJ-4");
    }

    #[test]
    fn test_kept_fields_are_not_pulled() {
        let pair = pair();
        let changes = detect_changes(&pair, |f| f == SyncField::Title || f == SyncField::Status);
        assert!(changes.iter().all(|c| c.field != "title" && c.field != "status"));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_apply_changes_updates_story() {
        let pair = pair();
        let changes = detect_changes(&pair, |_| false);
        let refs: Vec<&ChangeDetail> = changes.iter().collect();
        let mut story = pair.story.clone();

        apply_changes(&mut story, &pair, &refs);
        assert_eq!(story.title, "Login page");
        assert_eq!(story.status, Status::Done);
        assert_eq!(story.story_points, Some(5.0));
        assert!(story.subtasks[0].completed);
        assert_eq!(story.subtasks.len(), 3);
        assert_eq!(story.subtasks[2].name, "Docs");
        assert!(!story.subtasks[2].completed);
        assert_eq!(story.subtasks[2].story_points, Some(1.0));
    }

    #[test]
    fn test_pull_changes_grouping() {
        let pair = pair();
        let changes = PullChanges {
            changes: detect_changes(&pair, |_| false),
        };
        assert_eq!(changes.stories_changed(), 1);
        assert_eq!(changes.by_story()["US-001"].len(), 5);
        assert!(changes.changes[3].describe().contains("subtask 'Form'"));
    }
}
