//! The sync state machine: analyze, back up, check conflicts, execute,
//! finalize.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::audit::{AuditKind, AuditTrail};
use super::backup::BackupManager;
use super::commands::{
    AddCommentCommand, CommandKind, CreateSubtaskCommand, FailedOperation,
    TransitionStatusCommand, UpdateDescriptionCommand, UpdateSubtaskCommand,
};
use super::conflict::{
    create_snapshot_from_sync, ConflictDetector, ConflictReport, ConflictResolver,
    ResolutionStrategy, SnapshotStore, SyncDirection, SyncField,
};
use super::incremental::{ChangeTracker, IncrementalSyncStats};
use super::matching::{match_stories, match_subtasks, MatchedPair};
use super::parallel::{
    execute_batches, execute_sequential, BatchContext, ExecutedCommand, ParallelSyncResult,
    PlannedCommand, StoryBatch,
};
use super::state::{OperationStatus, StateStore, SyncPhase, SyncState};
use crate::config::{ExecutionMode, SyncConfig};
use crate::domain::{IssueKey, StoryId, UserStory};
use crate::error::{SyncError, TrackerError};
use crate::history::{ChangeRecord, SyncHistoryEntry, SyncHistoryStore, SyncOutcome};
use crate::ports::{
    description_to_text, statuses_equivalent, CreateSubtaskRequest, DocumentFormatterPort,
    DocumentParserPort, IssueData, IssueTrackerPort, SubtaskUpdate, TransitionGraph,
};

/// Cloneable flag for stopping a run between stories.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read-only picture of an epic: what matched and what did not.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub epic_key: String,
    pub markdown_path: PathBuf,
    pub total_stories: usize,
    /// Live tracker children of the epic, as fetched
    pub issues: Vec<IssueData>,
    pub matched: Vec<MatchedPair>,
    pub unmatched_markdown: Vec<UserStory>,
    pub unmatched_tracker: Vec<IssueData>,
    pub warnings: Vec<String>,
}

/// Outcome of one sync run.
///
/// The first ten fields are the stable contract external callers depend
/// on. `success` is true exactly when `errors` is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub dry_run: bool,
    pub stories_matched: usize,
    pub stories_updated: usize,
    pub subtasks_created: usize,
    pub subtasks_updated: usize,
    pub comments_added: usize,
    pub statuses_updated: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,

    #[serde(default)]
    pub failed_operations: Vec<FailedOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<ConflictReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalSyncStats>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub epic_key: String,
}

impl SyncResult {
    fn new(epic_key: &str, session_id: &str, dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            session_id: session_id.to_string(),
            epic_key: epic_key.to_string(),
            ..Self::default()
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.success = false;
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Total mutations counted, simulated ones included.
    pub fn total_changes(&self) -> usize {
        self.stories_updated
            + self.subtasks_created
            + self.subtasks_updated
            + self.comments_added
            + self.statuses_updated
    }

    pub fn summary(&self) -> String {
        format!(
            "{}{} stories matched, {} updated, {} subtasks created, {} subtasks updated, \
             {} comments added, {} statuses updated, {} error(s), {} warning(s)",
            if self.dry_run { "[DRY-RUN] " } else { "" },
            self.stories_matched,
            self.stories_updated,
            self.subtasks_created,
            self.subtasks_updated,
            self.comments_added,
            self.statuses_updated,
            self.errors.len(),
            self.warnings.len()
        )
    }
}

/// Per-run bookkeeping shared by the phases.
struct Run {
    state: Mutex<SyncState>,
    resumed: bool,
    completed_ops: HashSet<String>,
    audit: AuditTrail,
    result: SyncResult,
    started: Instant,
    started_at: DateTime<Utc>,
    executed: Vec<ExecutedCommand>,
}

impl Run {
    fn phase(&self) -> SyncPhase {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).phase
    }
}

/// Drives one markdown document against one epic.
///
/// The tracker, parser and formatter are borrowed; every store is optional
/// and injected through the `with_*` builders. Nothing is looked up
/// globally, so each `sync()` call is independent.
pub struct SyncOrchestrator<'a> {
    tracker: &'a dyn IssueTrackerPort,
    parser: &'a dyn DocumentParserPort,
    formatter: &'a dyn DocumentFormatterPort,
    config: SyncConfig,
    backups: Option<BackupManager>,
    states: Option<StateStore>,
    history: Option<&'a dyn SyncHistoryStore>,
    snapshots: Option<SnapshotStore>,
    fingerprints: Option<ChangeTracker>,
    audit_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        tracker: &'a dyn IssueTrackerPort,
        parser: &'a dyn DocumentParserPort,
        formatter: &'a dyn DocumentFormatterPort,
        config: SyncConfig,
    ) -> Self {
        Self {
            tracker,
            parser,
            formatter,
            config,
            backups: None,
            states: None,
            history: None,
            snapshots: None,
            fingerprints: None,
            audit_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_backup_manager(mut self, manager: BackupManager) -> Self {
        self.backups = Some(manager);
        self
    }

    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.states = Some(store);
        self
    }

    pub fn with_history_store(mut self, store: &'a dyn SyncHistoryStore) -> Self {
        self.history = Some(store);
        self
    }

    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_change_tracker(mut self, tracker: ChangeTracker) -> Self {
        self.fingerprints = Some(tracker);
        self
    }

    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn parser(&self) -> &'a dyn DocumentParserPort {
        self.parser
    }

    pub fn formatter(&self) -> &'a dyn DocumentFormatterPort {
        self.formatter
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Retry a tracker read on rate-limit and transient errors.
    fn read<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, TrackerError>,
    ) -> Result<T, TrackerError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < self.config.read_retries => {
                    attempt += 1;
                    let delay = match e.retry_after() {
                        Some(secs) => Duration::from_secs(secs),
                        None => Duration::from_millis(self.config.retry_delay_ms),
                    };
                    log::warn!(
                        "Reading {} failed ({}), retry {}/{} in {:?}",
                        what,
                        e,
                        attempt,
                        self.config.read_retries,
                        delay
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Parse, fetch and match without touching the tracker.
    pub fn analyze(&self, markdown_path: &Path, epic_key: &str) -> Result<AnalysisResult, SyncError> {
        let stories = self.parser.parse_stories(markdown_path)?;
        log::info!(
            "Parsed {} stories from {}",
            stories.len(),
            markdown_path.display()
        );
        self.analyze_stories(markdown_path, epic_key, stories)
    }

    /// Fetch and match already-parsed stories against `epic_key`.
    pub fn analyze_stories(
        &self,
        markdown_path: &Path,
        epic_key: &str,
        stories: Vec<UserStory>,
    ) -> Result<AnalysisResult, SyncError> {
        let stories: Vec<UserStory> = stories
            .into_iter()
            .filter(|s| self.config.includes_story(s.id.as_str(), &s.title))
            .collect();

        let issues = self.read(&format!("children of {epic_key}"), || {
            self.tracker.get_epic_children(epic_key)
        })?;
        log::info!("Fetched {} issues under {}", issues.len(), epic_key);

        let outcome = match_stories(&stories, &issues, self.config.positional_fallback);
        Ok(AnalysisResult {
            epic_key: epic_key.to_string(),
            markdown_path: markdown_path.to_path_buf(),
            total_stories: stories.len(),
            issues,
            matched: outcome.matched,
            unmatched_markdown: outcome.unmatched_stories,
            unmatched_tracker: outcome.unmatched_issues,
            warnings: outcome.warnings,
        })
    }

    /// Push the markdown document into the epic.
    ///
    /// Per-command failures end up in the result. Unparseable documents, an
    /// unreachable tracker, authentication failures and failed backups are
    /// returned as errors, after the audit trail and history are written.
    pub fn sync(&self, markdown_path: &Path, epic_key: &str) -> Result<SyncResult, SyncError> {
        self.run_sync(markdown_path, epic_key, None)
    }

    /// Push `stories`, one epic's section of the document at `markdown_path`,
    /// into `epic_key`. Nothing else from the document is considered.
    pub fn sync_stories(
        &self,
        markdown_path: &Path,
        epic_key: &str,
        stories: Vec<UserStory>,
    ) -> Result<SyncResult, SyncError> {
        self.run_sync(markdown_path, epic_key, Some(stories))
    }

    fn run_sync(
        &self,
        markdown_path: &Path,
        epic_key: &str,
        stories: Option<Vec<UserStory>>,
    ) -> Result<SyncResult, SyncError> {
        let mut run = self.start_run(markdown_path, epic_key);

        let outcome = self.run_phases(&mut run, markdown_path, epic_key, stories);
        if let Err(e) = &outcome {
            log::error!("Sync of {epic_key} failed: {e}");
            let phase = run.phase();
            run.audit.error(phase, None, e.to_string());
            run.result.add_error(e.to_string());
        }
        self.finalize(&mut run, outcome.as_ref().err());

        outcome.map(|()| run.result)
    }

    fn start_run(&self, markdown_path: &Path, epic_key: &str) -> Run {
        let resumable = match (&self.states, self.config.resume) {
            (Some(store), true) => match store.find_resumable(epic_key) {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("Could not look up resumable sessions for {epic_key}: {e:#}");
                    None
                }
            },
            _ => None,
        };

        let (state, resumed) = match resumable {
            Some(mut state) if state.dry_run == self.config.dry_run => match state.resume() {
                Ok(()) => (state, true),
                Err(e) => {
                    log::warn!("{e:#}");
                    (SyncState::new(epic_key, markdown_path, self.config.dry_run), false)
                }
            },
            _ => (SyncState::new(epic_key, markdown_path, self.config.dry_run), false),
        };

        let completed_ops = state
            .completed_operations()
            .map(|op| op.operation_id.clone())
            .collect();
        let mut audit = AuditTrail::new(&state.session_id, epic_key);
        if resumed {
            audit.record(
                AuditKind::Phase,
                SyncPhase::Executing,
                None,
                format!("resumed session {}", state.session_id),
                true,
            );
        }

        log::info!(
            "Starting sync {} of {} into {}{}",
            state.session_id,
            markdown_path.display(),
            epic_key,
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        Run {
            result: SyncResult::new(epic_key, &state.session_id, self.config.dry_run),
            state: Mutex::new(state),
            resumed,
            completed_ops,
            audit,
            started: Instant::now(),
            started_at: Utc::now(),
            executed: Vec::new(),
        }
    }

    fn enter(&self, run: &mut Run, phase: SyncPhase) -> Result<(), SyncError> {
        if run.resumed && phase < SyncPhase::Executing {
            run.audit.phase(phase);
            return Ok(());
        }
        run.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .advance(phase)?;
        run.audit.phase(phase);
        self.save_state(run);
        Ok(())
    }

    fn save_state(&self, run: &Run) {
        if let Some(store) = &self.states {
            let state = run.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = store.save(&state) {
                log::warn!("Could not persist sync state {}: {e:#}", state.session_id);
            }
        }
    }

    fn run_phases(
        &self,
        run: &mut Run,
        markdown_path: &Path,
        epic_key: &str,
        stories: Option<Vec<UserStory>>,
    ) -> Result<(), SyncError> {
        self.enter(run, SyncPhase::Analyzing)?;
        self.config.validate()?;
        let analysis = match stories {
            Some(stories) => self.analyze_stories(markdown_path, epic_key, stories)?,
            None => self.analyze(markdown_path, epic_key)?,
        };
        run.result.stories_matched = analysis.matched.len();
        for warning in &analysis.warnings {
            run.audit
                .record(AuditKind::Warning, SyncPhase::Analyzing, None, warning.clone(), true);
        }
        run.result.warnings.extend(analysis.warnings.iter().cloned());

        self.enter(run, SyncPhase::BackingUp)?;
        self.backup(run, markdown_path, &analysis)?;

        self.enter(run, SyncPhase::Diffing)?;
        let skip = match self.check_conflicts(run, &analysis)? {
            Some(skip) => skip,
            None => return Ok(()),
        };

        let pairs = self.select_changed(run, &analysis)?;

        let graph = if self.config.transitions.is_empty() {
            self.tracker.transition_graph()
        } else {
            TransitionGraph::from_map(&self.config.transitions)
        };
        let batches: Vec<StoryBatch> = pairs
            .iter()
            .map(|pair| self.plan_story(run, pair, &skip, &graph))
            .collect();

        self.enter(run, SyncPhase::Executing)?;
        let outcome = self.execute(run, &batches)?;
        let fatal = self.collect(run, &outcome);

        if !self.config.dry_run {
            self.record_post_state(run, markdown_path, &analysis, &outcome, &skip);
        }

        match fatal {
            Some(e) => Err(SyncError::Tracker(e)),
            None => Ok(()),
        }
    }

    fn backup(&self, run: &mut Run, markdown_path: &Path, analysis: &AnalysisResult) -> Result<(), SyncError> {
        if !self.config.backup.enabled {
            log::debug!("Backups disabled");
            return Ok(());
        }
        if self.config.dry_run {
            log::info!("Dry run: skipping backup of {}", analysis.epic_key);
            return Ok(());
        }
        let Some(manager) = &self.backups else {
            run.result
                .add_warning("Backups are enabled but no backup manager is configured");
            return Ok(());
        };

        let backup = manager
            .create_backup_from_issues(self.tracker, &analysis.epic_key, markdown_path, &analysis.issues)
            .map_err(|e| SyncError::Storage(e.context("Backup failed; no changes were made")))?;
        run.audit.record(
            AuditKind::Operation,
            SyncPhase::BackingUp,
            Some(analysis.epic_key.as_str()),
            format!("created backup {}", backup.backup_id),
            true,
        );
        run.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .backup_id = Some(backup.backup_id.clone());
        run.result.backup_id = Some(backup.backup_id);
        Ok(())
    }

    /// Fields to leave alone, or `None` when the run must stop for manual
    /// resolution.
    fn check_conflicts(
        &self,
        run: &mut Run,
        analysis: &AnalysisResult,
    ) -> Result<Option<HashSet<(String, SyncField)>>, SyncError> {
        let Some(store) = &self.snapshots else {
            return Ok(Some(HashSet::new()));
        };
        let Some(snapshot) = store.load(&analysis.epic_key)? else {
            log::debug!("No previous snapshot for {}; skipping conflict check", analysis.epic_key);
            return Ok(Some(HashSet::new()));
        };

        let report = ConflictDetector::new(SyncDirection::Push).detect(
            &analysis.epic_key,
            &snapshot,
            &analysis.matched,
            self.formatter,
        );
        for conflict in &report.conflicts {
            run.audit.record(
                AuditKind::Conflict,
                SyncPhase::Diffing,
                Some(conflict.issue_key.as_str()),
                conflict.description(),
                false,
            );
        }
        if !report.has_conflicts() {
            return Ok(Some(HashSet::new()));
        }

        let strategy = self.config.resolution_strategy;
        if strategy == ResolutionStrategy::Manual {
            run.result.add_error(format!(
                "{} conflict(s) need manual resolution; nothing was changed",
                report.conflict_count()
            ));
            run.result.conflicts = Some(report);
            return Ok(None);
        }

        let markdown_modified = fs::metadata(&analysis.markdown_path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let resolutions = ConflictResolver::resolve(&report, strategy, markdown_modified);
        let skip = ConflictResolver::fields_to_skip(&resolutions);
        for resolution in resolutions.iter().filter(|r| {
            skip.contains(&(r.conflict.story_id.clone(), r.conflict.field))
        }) {
            run.result.add_warning(format!(
                "Kept tracker {} of {} ({})",
                resolution.conflict.field, resolution.conflict.issue_key, resolution.reason
            ));
        }
        run.result.conflicts = Some(report);
        Ok(Some(skip))
    }

    /// Matched pairs still worth syncing; unchanged stories drop out in
    /// incremental mode.
    fn select_changed<'p>(
        &self,
        run: &mut Run,
        analysis: &'p AnalysisResult,
    ) -> Result<Vec<&'p MatchedPair>, SyncError> {
        let all: Vec<&MatchedPair> = analysis.matched.iter().collect();
        if !self.config.incremental {
            return Ok(all);
        }
        let Some(tracker) = &self.fingerprints else {
            run.result
                .add_warning("Incremental sync requested but no fingerprint store is configured");
            return Ok(all);
        };

        let stories: Vec<UserStory> = analysis.matched.iter().map(|p| p.story.clone()).collect();
        let changes = tracker.detect_changes(&analysis.epic_key, &stories)?;
        let stats = changes.stats();
        log::info!(
            "Incremental sync: {} changed, {} unchanged",
            stats.changed_stories,
            stats.skipped_stories
        );
        run.result.incremental = Some(stats);
        Ok(all
            .into_iter()
            .filter(|p| changes.is_changed(&p.story.id))
            .collect())
    }

    fn plan_story(
        &self,
        run: &mut Run,
        pair: &MatchedPair,
        skip: &HashSet<(String, SyncField)>,
        graph: &TransitionGraph,
    ) -> StoryBatch {
        let story = &pair.story;
        let issue = &pair.issue;
        let dry_run = self.config.dry_run;
        let skipped = |field: SyncField| skip.contains(&(story.id.to_string(), field));
        let mut batch = StoryBatch::new(story.id.clone(), &issue.key);

        if self.config.sync_descriptions && !skipped(SyncField::Description) {
            if let Some(markdown) = story.description_markdown() {
                let formatted = self.formatter.format_text(&markdown);
                let new_text = description_to_text(Some(&formatted));
                let old_text = issue.description_text();
                if new_text != old_text {
                    batch.push(
                        PlannedCommand::new(
                            UpdateDescriptionCommand::new(&issue.key, formatted, dry_run),
                            "story",
                        )
                        .changing("description", old_text, new_text),
                    );
                }
            }
        }

        let mut completed_subtasks = Vec::new();
        if self.config.sync_subtasks && self.tracker.capabilities().supports_subtasks {
            for (idx, existing) in match_subtasks(&story.subtasks, &issue.subtasks) {
                let subtask = &story.subtasks[idx];
                match existing {
                    None => {
                        let request = CreateSubtaskRequest {
                            parent_key: issue.key.clone(),
                            summary: subtask.name.clone(),
                            description: self.formatter.format_text(&subtask.description),
                            project_key: self.project_key(&issue.key),
                            story_points: subtask.story_points,
                            assignee: subtask.assignee.clone(),
                        };
                        batch.push(PlannedCommand::new(
                            CreateSubtaskCommand::new(request, dry_run),
                            "subtask",
                        ));
                    }
                    Some(live) => {
                        let update = self.subtask_update(subtask, live);
                        if !update.is_empty() {
                            batch.push(PlannedCommand::new(
                                UpdateSubtaskCommand::new(&live.key, update, dry_run),
                                "subtask",
                            ));
                        }
                        if subtask.completed && !statuses_equivalent(&live.status, "Done") {
                            completed_subtasks.push((live.key.clone(), live.status.clone()));
                        }
                    }
                }
            }
        }

        if self.config.sync_comments && !story.comments.is_empty() {
            match self.read(&format!("comments of {}", issue.key), || {
                self.tracker.get_issue_comments(&issue.key)
            }) {
                Ok(live) => {
                    for comment in &story.comments {
                        let body = comment.body.trim();
                        if body.is_empty() || live.iter().any(|c| c.body.trim() == body) {
                            continue;
                        }
                        batch.push(PlannedCommand::new(
                            AddCommentCommand::new(&issue.key, self.formatter.format_text(body), dry_run),
                            "story",
                        ));
                    }
                }
                Err(e) => run.result.add_warning(format!(
                    "Skipped comments of {}: could not read existing comments ({e})",
                    issue.key
                )),
            }
        }

        if self.config.sync_statuses {
            let target = story.status.tracker_name();
            if !skipped(SyncField::Status) && !statuses_equivalent(&issue.status, target) {
                batch.push(
                    PlannedCommand::new(
                        TransitionStatusCommand::new(&issue.key, target, graph.clone(), dry_run),
                        "story",
                    )
                    .changing("status", issue.status.clone(), target.to_string()),
                );
            }
            for (key, status) in completed_subtasks {
                batch.push(
                    PlannedCommand::new(
                        TransitionStatusCommand::new(&key, "Done", graph.clone(), dry_run),
                        "subtask",
                    )
                    .changing("status", status, "Done".to_string()),
                );
            }
        }

        log::debug!(
            "Planned {} command(s) for {} -> {}",
            batch.commands.len(),
            story.id,
            issue.key
        );
        batch
    }

    fn project_key(&self, issue_key: &str) -> String {
        match &self.config.project_key {
            Some(key) => key.clone(),
            None => IssueKey::parse(issue_key)
                .map(|k| k.project().to_string())
                .unwrap_or_default(),
        }
    }

    fn subtask_update(&self, subtask: &crate::domain::Subtask, live: &IssueData) -> SubtaskUpdate {
        let mut update = SubtaskUpdate::default();
        if subtask.name.trim() != live.summary.trim() {
            update.summary = Some(subtask.name.clone());
        }
        if !subtask.description.trim().is_empty() {
            let formatted = self.formatter.format_text(&subtask.description);
            if description_to_text(Some(&formatted)) != live.description_text() {
                update.description = Some(formatted);
            }
        }
        if subtask.story_points.is_some() && subtask.story_points != live.story_points {
            update.story_points = subtask.story_points;
        }
        if subtask.assignee.is_some() && subtask.assignee != live.assignee {
            update.assignee = subtask.assignee.clone();
        }
        update
    }

    fn execute(&self, run: &mut Run, batches: &[StoryBatch]) -> Result<ParallelSyncResult, SyncError> {
        let abort = AtomicBool::new(false);
        let state = &run.state;
        let states = self.states.as_ref();
        let observer = |executed: &ExecutedCommand| {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.record(
                &executed.operation_id,
                executed.kind,
                &executed.target_key,
                executed.status,
                (executed.status == OperationStatus::Failed).then(|| executed.message.clone()),
            );
            if let Some(store) = states {
                if let Err(e) = store.save(&state) {
                    log::warn!("Could not persist sync state {}: {e:#}", state.session_id);
                }
            }
        };

        let ctx = BatchContext {
            tracker: self.tracker,
            completed: &run.completed_ops,
            cancel: &self.cancel,
            abort: &abort,
            observer: &observer,
        };

        let result = match self.config.execution {
            ExecutionMode::Sequential => execute_sequential(&ctx, batches),
            ExecutionMode::Parallel { max_workers } => execute_batches(&ctx, batches, max_workers)?,
        };
        Ok(result)
    }

    /// Fold batch outcomes into the result; returns the first fatal error.
    fn collect(&self, run: &mut Run, outcome: &ParallelSyncResult) -> Option<TrackerError> {
        let mut not_started = 0;
        for batch in &outcome.outcomes {
            if batch.cancelled {
                not_started += 1;
                continue;
            }
            for executed in &batch.executed {
                let success = executed.status != OperationStatus::Failed;
                run.audit.record(
                    AuditKind::Operation,
                    SyncPhase::Executing,
                    Some(executed.target_key.as_str()),
                    format!("{}: {}", executed.kind, executed.message),
                    success,
                );
                if executed.status != OperationStatus::Completed {
                    continue;
                }
                match executed.kind {
                    CommandKind::UpdateDescription => run.result.stories_updated += 1,
                    CommandKind::CreateSubtask => run.result.subtasks_created += 1,
                    CommandKind::UpdateSubtask => run.result.subtasks_updated += 1,
                    CommandKind::AddComment => run.result.comments_added += 1,
                    CommandKind::TransitionStatus => run.result.statuses_updated += 1,
                }
            }
            for failed in &batch.failed {
                run.result
                    .add_error(format!("{}: {}", failed.description, failed.error));
                run.result.failed_operations.push(failed.clone());
            }
            run.executed.extend(batch.executed.iter().cloned());
        }

        if not_started > 0 {
            run.result.cancelled = true;
            run.result.add_warning(format!(
                "Sync cancelled; {} of {} stories were not processed",
                not_started,
                outcome.outcomes.len()
            ));
            run.audit.record(
                AuditKind::Warning,
                SyncPhase::Executing,
                None,
                "cancelled by operator",
                true,
            );
        }

        outcome.fatal().cloned()
    }

    /// Persist the conflict snapshot and the fingerprints of clean stories.
    ///
    /// Fields kept on the tracker side of a conflict are recorded with the
    /// markdown value, so the next run raises the same conflict instead of
    /// treating the markdown as a fresh local edit.
    fn record_post_state(
        &self,
        run: &mut Run,
        markdown_path: &Path,
        analysis: &AnalysisResult,
        outcome: &ParallelSyncResult,
        kept_on_tracker: &HashSet<(String, SyncField)>,
    ) {
        let mut markdown_side: HashSet<(StoryId, SyncField)> = analysis
            .matched
            .iter()
            .flat_map(|pair| {
                let id = pair.story.id.to_string();
                SyncField::ALL
                    .into_iter()
                    .filter(move |&field| kept_on_tracker.contains(&(id.clone(), field)))
                    .map(move |field| (pair.story.id.clone(), field))
            })
            .collect();
        for batch in &outcome.outcomes {
            for executed in &batch.executed {
                let landed = matches!(
                    executed.status,
                    OperationStatus::Completed | OperationStatus::Skipped
                );
                if !landed || executed.target_key != batch.issue_key {
                    continue;
                }
                match executed.kind {
                    CommandKind::UpdateDescription => {
                        markdown_side.insert((batch.story_id.clone(), SyncField::Description));
                    }
                    CommandKind::TransitionStatus => {
                        markdown_side.insert((batch.story_id.clone(), SyncField::Status));
                    }
                    _ => {}
                }
            }
        }

        if let Some(store) = &self.snapshots {
            let snapshot = create_snapshot_from_sync(
                &analysis.epic_key,
                markdown_path,
                &analysis.matched,
                self.formatter,
                &markdown_side,
            );
            if let Err(e) = store.save(&snapshot) {
                run.result
                    .add_warning(format!("Could not save conflict snapshot: {e:#}"));
            }
        }

        if let Some(tracker) = &self.fingerprints {
            let clean: HashSet<&StoryId> = outcome
                .outcomes
                .iter()
                .filter(|o| o.is_clean())
                .map(|o| &o.story_id)
                .collect();
            let synced: Vec<&UserStory> = analysis
                .matched
                .iter()
                .map(|p| &p.story)
                .filter(|s| clean.contains(&s.id))
                .collect();
            if let Err(e) = tracker.record_synced(&analysis.epic_key, &synced) {
                run.result
                    .add_warning(format!("Could not save story fingerprints: {e:#}"));
            }
        }
    }

    fn history_outcome(&self, run: &Run, error: Option<&SyncError>) -> SyncOutcome {
        let succeeded = run
            .executed
            .iter()
            .any(|e| e.status == OperationStatus::Completed);
        if error.is_some() {
            if succeeded && !self.config.dry_run {
                SyncOutcome::Partial
            } else {
                SyncOutcome::Failed
            }
        } else if run.result.cancelled {
            SyncOutcome::Cancelled
        } else if self.config.dry_run {
            SyncOutcome::DryRun
        } else if run.result.errors.is_empty() {
            SyncOutcome::Success
        } else if succeeded {
            SyncOutcome::Partial
        } else {
            SyncOutcome::Failed
        }
    }

    fn finalize(&self, run: &mut Run, error: Option<&SyncError>) {
        let terminal = match error {
            Some(_) => SyncPhase::Failed,
            None if run.result.cancelled => SyncPhase::Cancelled,
            None if !run.result.success && run.result.conflicts.is_some() && run.executed.is_empty() => {
                SyncPhase::Failed
            }
            None => SyncPhase::Completed,
        };
        {
            let mut state = run.state.lock().unwrap_or_else(|e| e.into_inner());
            match error {
                Some(e) => state.fail(e.to_string()),
                None => {
                    if let Err(e) = state.advance(terminal) {
                        log::warn!("{e:#}");
                    }
                }
            }
        }
        run.audit.phase(terminal);
        self.save_state(run);

        if let Some(history) = self.history {
            if let Err(e) = self.write_history(history, run, error) {
                log::warn!("Could not record sync history: {e:#}");
                run.result
                    .add_warning(format!("Could not record sync history: {e:#}"));
            }
        }

        if let Some(dir) = &self.audit_dir {
            if let Err(e) = run.audit.save(dir) {
                log::warn!("Could not save audit trail: {e:#}");
            }
        }

        log::info!("Sync {} finished: {}", run.result.session_id, run.result.summary());
    }

    fn write_history(
        &self,
        history: &dyn SyncHistoryStore,
        run: &Run,
        error: Option<&SyncError>,
    ) -> anyhow::Result<()> {
        let state = run.state.lock().map_err(|_| anyhow!("sync state lock poisoned"))?;
        let count = |status: OperationStatus| run.executed.iter().filter(|e| e.status == status).count();

        let mut entry = SyncHistoryEntry::new(
            &state.session_id,
            &state.markdown_path,
            &state.epic_key,
            self.tracker.name(),
            self.history_outcome(run, error),
        );
        entry.started_at = run.started_at;
        entry.completed_at = Utc::now();
        entry.duration_seconds = run.started.elapsed().as_secs_f64();
        entry.operations_total = run.executed.len();
        entry.operations_succeeded = count(OperationStatus::Completed);
        entry.operations_failed = count(OperationStatus::Failed);
        entry.operations_skipped = count(OperationStatus::Skipped);
        entry.dry_run = self.config.dry_run;
        entry.config_snapshot = serde_json::to_value(&self.config)?;
        entry.error_message = error
            .map(|e| e.to_string())
            .or_else(|| run.result.errors.first().cloned());
        if let Some(backup_id) = &run.result.backup_id {
            entry.metadata.insert("backup_id".to_string(), backup_id.clone());
        }
        entry
            .metadata
            .insert("stories_matched".to_string(), run.result.stories_matched.to_string());
        history.record(&entry)?;

        drop(state);

        if !self.config.dry_run {
            let changes: Vec<ChangeRecord> = run
                .executed
                .iter()
                .filter(|e| e.status == OperationStatus::Completed)
                .map(|e| {
                    let operation = match e.kind {
                        CommandKind::CreateSubtask => "create",
                        CommandKind::UpdateDescription | CommandKind::UpdateSubtask => "update",
                        CommandKind::AddComment => "comment",
                        CommandKind::TransitionStatus => "transition",
                    };
                    let entity_id = e.created_key.as_deref().unwrap_or(&e.target_key);
                    let change = ChangeRecord::new(&entry.entry_id, operation, &e.entity_type, entity_id)
                        .for_story(&e.story_id);
                    match &e.field {
                        Some(field) => change.with_field(field, e.old_value.clone(), e.new_value.clone()),
                        None => change,
                    }
                })
                .collect();
            history.record_changes(&changes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Comment;
    use crate::error::ParserError;
    use crate::ports::Transition;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    /// Fails epic reads with a transient error `failures` times.
    struct SlowTracker {
        failures: usize,
        reads: AtomicUsize,
    }

    impl IssueTrackerPort for SlowTracker {
        fn name(&self) -> &str {
            "slow"
        }
        fn get_epic_children(&self, _epic_key: &str) -> Result<Vec<IssueData>, TrackerError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TrackerError::transient("connection reset"));
            }
            let mut issue = IssueData::new("PROJ-1", "US-001: Login");
            issue.status = "To Do".to_string();
            Ok(vec![issue])
        }
        fn get_issue(&self, key: &str) -> Result<IssueData, TrackerError> {
            Ok(IssueData::new(key, key))
        }
        fn get_issue_comments(&self, _key: &str) -> Result<Vec<Comment>, TrackerError> {
            Ok(Vec::new())
        }
        fn get_issue_status(&self, _key: &str) -> Result<String, TrackerError> {
            Ok("To Do".to_string())
        }
        fn update_issue_description(&self, _key: &str, _content: &Value) -> Result<bool, TrackerError> {
            Ok(true)
        }
        fn create_subtask(&self, _r: &CreateSubtaskRequest) -> Result<Option<String>, TrackerError> {
            Ok(None)
        }
        fn update_subtask(&self, _key: &str, _u: &SubtaskUpdate) -> Result<bool, TrackerError> {
            Ok(true)
        }
        fn add_comment(&self, _key: &str, _body: &Value) -> Result<bool, TrackerError> {
            Ok(true)
        }
        fn transition_issue(&self, _key: &str, _status: &str) -> Result<bool, TrackerError> {
            Ok(true)
        }
        fn get_available_transitions(&self, _key: &str) -> Result<Vec<Transition>, TrackerError> {
            Ok(Vec::new())
        }
    }

    struct OneStory;

    impl DocumentParserPort for OneStory {
        fn parse_stories(&self, _path: &Path) -> Result<Vec<UserStory>, ParserError> {
            Ok(vec![UserStory::new(StoryId::parse("US-001").unwrap(), "Login")])
        }
    }

    struct Plain;

    impl DocumentFormatterPort for Plain {
        fn format_text(&self, markdown: &str) -> Value {
            Value::String(markdown.to_string())
        }
    }

    fn config(read_retries: u32) -> SyncConfig {
        SyncConfig {
            read_retries,
            retry_delay_ms: 0,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_cancellation_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_analyze_retries_transient_reads() {
        let tracker = SlowTracker {
            failures: 2,
            reads: AtomicUsize::new(0),
        };
        let orchestrator = SyncOrchestrator::new(&tracker, &OneStory, &Plain, config(2));

        let analysis = orchestrator.analyze(Path::new("stories.md"), "PROJ-0").unwrap();
        assert_eq!(analysis.matched.len(), 1);
        assert_eq!(analysis.matched[0].issue.key, "PROJ-1");
        assert_eq!(tracker.reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_analyze_gives_up_after_read_retries() {
        let tracker = SlowTracker {
            failures: 5,
            reads: AtomicUsize::new(0),
        };
        let orchestrator = SyncOrchestrator::new(&tracker, &OneStory, &Plain, config(1));

        let err = orchestrator
            .analyze(Path::new("stories.md"), "PROJ-0")
            .unwrap_err();
        assert!(matches!(err, SyncError::Tracker(TrackerError::Transient { .. })));
        assert_eq!(tracker.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dry_run_sync_counts_simulated_changes() {
        let tracker = SlowTracker {
            failures: 0,
            reads: AtomicUsize::new(0),
        };
        let orchestrator = SyncOrchestrator::new(&tracker, &OneStory, &Plain, config(0));

        let result = orchestrator.sync(Path::new("stories.md"), "PROJ-0").unwrap();
        assert!(result.success);
        assert!(result.dry_run);
        assert_eq!(result.stories_matched, 1);
        // "Planned" goes to Backlog; simulated, never sent
        assert_eq!(result.statuses_updated, 1);
        assert_eq!(result.total_changes(), 1);
        assert!(result.summary().starts_with("[DRY-RUN]"));
    }

    #[test]
    fn test_add_error_clears_success() {
        let mut result = SyncResult::new("PROJ-0", "sync-1", false);
        assert!(result.success);
        result.add_warning("just a warning");
        assert!(result.success);
        result.add_error("boom");
        assert!(!result.success);
        assert_eq!(result.errors, vec!["boom".to_string()]);
    }
}
