//! Execution of per-story command batches, one after another or on a
//! bounded rayon pool.
//!
//! A batch is every command planned for one matched story. Batches are
//! independent: a failure inside one never cancels another. Only a fatal
//! tracker error (authentication) raises the shared abort flag, which stops
//! every batch from starting further commands.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use super::commands::{Command, CommandKind, FailedOperation};
use super::orchestrator::CancellationToken;
use super::state::OperationStatus;
use crate::domain::StoryId;
use crate::error::TrackerError;
use crate::ports::IssueTrackerPort;

/// A command plus what it changes, for history and snapshots.
pub struct PlannedCommand {
    pub command: Box<dyn Command>,
    /// `story` or `subtask`
    pub entity_type: &'static str,
    pub field: Option<&'static str>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl PlannedCommand {
    pub fn new(command: impl Command + 'static, entity_type: &'static str) -> Self {
        Self {
            command: Box::new(command),
            entity_type,
            field: None,
            old_value: None,
            new_value: None,
        }
    }

    pub fn changing(mut self, field: &'static str, old: String, new: String) -> Self {
        self.field = Some(field);
        self.old_value = Some(old);
        self.new_value = Some(new);
        self
    }
}

/// Commands for one matched story, in execution order.
pub struct StoryBatch {
    pub story_id: StoryId,
    pub issue_key: String,
    pub commands: Vec<PlannedCommand>,
}

impl StoryBatch {
    pub fn new(story_id: StoryId, issue_key: &str) -> Self {
        Self {
            story_id,
            issue_key: issue_key.to_string(),
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, planned: PlannedCommand) {
        self.commands.push(planned);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// What happened to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedCommand {
    pub story_id: String,
    pub operation_id: String,
    pub kind: CommandKind,
    pub target_key: String,
    pub status: OperationStatus,
    pub message: String,
    pub dry_run: bool,
    pub created_key: Option<String>,
    pub entity_type: String,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub story_id: StoryId,
    pub issue_key: String,
    pub executed: Vec<ExecutedCommand>,
    pub failed: Vec<FailedOperation>,
    /// Set when an authentication failure stopped this batch
    pub fatal: Option<TrackerError>,
    /// The batch never started because the run was cancelled
    pub cancelled: bool,
    /// Commands left unexecuted after the abort flag was raised
    pub aborted: bool,
}

impl BatchOutcome {
    fn empty(batch: &StoryBatch) -> Self {
        Self {
            story_id: batch.story_id.clone(),
            issue_key: batch.issue_key.clone(),
            executed: Vec::new(),
            failed: Vec::new(),
            fatal: None,
            cancelled: false,
            aborted: false,
        }
    }

    /// Every command ran and none failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.fatal.is_none() && !self.cancelled && !self.aborted
    }

    pub fn completed(&self) -> impl Iterator<Item = &ExecutedCommand> {
        self.executed
            .iter()
            .filter(|e| e.status == OperationStatus::Completed)
    }
}

/// Outcomes of every batch, in the order the batches were given.
#[derive(Debug, Default)]
pub struct ParallelSyncResult {
    pub outcomes: Vec<BatchOutcome>,
    pub workers: usize,
}

impl ParallelSyncResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_clean()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.failed.is_empty() || o.fatal.is_some())
            .count()
    }

    pub fn failed_operations(&self) -> impl Iterator<Item = &FailedOperation> {
        self.outcomes.iter().flat_map(|o| o.failed.iter())
    }

    /// First fatal error, in batch order.
    pub fn fatal(&self) -> Option<&TrackerError> {
        self.outcomes.iter().find_map(|o| o.fatal.as_ref())
    }
}

/// Shared inputs of a batch run.
pub struct BatchContext<'a> {
    pub tracker: &'a dyn IssueTrackerPort,
    /// Operation IDs a resumed session already completed
    pub completed: &'a HashSet<String>,
    pub cancel: &'a CancellationToken,
    pub abort: &'a AtomicBool,
    /// Called after every command, from whichever thread ran it
    pub observer: &'a (dyn Fn(&ExecutedCommand) + Sync),
}

/// Run one batch's commands in order.
pub fn execute_batch(ctx: &BatchContext<'_>, batch: &StoryBatch) -> BatchOutcome {
    let mut outcome = BatchOutcome::empty(batch);
    if ctx.cancel.is_cancelled() {
        outcome.cancelled = true;
        return outcome;
    }

    for planned in &batch.commands {
        if ctx.abort.load(Ordering::SeqCst) {
            outcome.aborted = true;
            break;
        }

        let command = planned.command.as_ref();
        let operation_id = command.operation_id();
        let record = |status: OperationStatus, message: String, created_key: Option<String>| {
            ExecutedCommand {
                story_id: batch.story_id.to_string(),
                operation_id: operation_id.clone(),
                kind: command.kind(),
                target_key: command.target_key().to_string(),
                status,
                message,
                dry_run: command.is_dry_run(),
                created_key,
                entity_type: planned.entity_type.to_string(),
                field: planned.field.map(str::to_string),
                old_value: planned.old_value.clone(),
                new_value: planned.new_value.clone(),
            }
        };

        let executed = if ctx.completed.contains(&operation_id) {
            log::info!("Skipping already completed: {}", command.describe());
            record(
                OperationStatus::Skipped,
                "completed by an earlier session".to_string(),
                None,
            )
        } else {
            match command.execute(ctx.tracker) {
                Ok(result) if result.success => {
                    log::info!("{}", result.message);
                    record(OperationStatus::Completed, result.message, result.created_key)
                }
                Ok(result) => {
                    log::warn!("{} failed: {}", command.describe(), result.message);
                    outcome.failed.push(FailedOperation::from_result(command, &result));
                    record(OperationStatus::Failed, result.message, None)
                }
                Err(e) => {
                    log::warn!("{} failed: {}", command.describe(), e);
                    outcome.failed.push(FailedOperation::from_error(command, &e));
                    let executed = record(OperationStatus::Failed, e.to_string(), None);
                    if e.is_fatal() {
                        log::error!("Fatal tracker error, aborting remaining commands: {e}");
                        ctx.abort.store(true, Ordering::SeqCst);
                        (ctx.observer)(&executed);
                        outcome.executed.push(executed);
                        outcome.fatal = Some(e);
                        break;
                    }
                    executed
                }
            }
        };

        (ctx.observer)(&executed);
        outcome.executed.push(executed);
    }

    outcome
}

/// Run batches one after another on the calling thread.
pub fn execute_sequential(ctx: &BatchContext<'_>, batches: &[StoryBatch]) -> ParallelSyncResult {
    ParallelSyncResult {
        outcomes: batches.iter().map(|b| execute_batch(ctx, b)).collect(),
        workers: 1,
    }
}

/// Run batches on a pool of at most `max_workers` threads.
///
/// Order of the returned outcomes matches `batches`.
pub fn execute_batches(
    ctx: &BatchContext<'_>,
    batches: &[StoryBatch],
    max_workers: usize,
) -> Result<ParallelSyncResult> {
    let workers = max_workers.clamp(1, batches.len().max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("Failed to build sync worker pool")?;

    log::info!(
        "Executing {} story batch(es) on {} worker(s)",
        batches.len(),
        workers
    );
    let outcomes = pool.install(|| {
        batches
            .par_iter()
            .map(|batch| execute_batch(ctx, batch))
            .collect::<Vec<_>>()
    });

    Ok(ParallelSyncResult { outcomes, workers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Comment;
    use crate::ports::{CreateSubtaskRequest, IssueData, SubtaskUpdate, Transition};
    use crate::sync::commands::{AddCommentCommand, UpdateDescriptionCommand};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Fails description updates for `missing` and authentication for `locked`.
    struct FlakyTracker {
        missing: &'static str,
        locked: &'static str,
        writes: AtomicUsize,
    }

    impl FlakyTracker {
        fn new(missing: &'static str, locked: &'static str) -> Self {
            Self {
                missing,
                locked,
                writes: AtomicUsize::new(0),
            }
        }
    }

    impl IssueTrackerPort for FlakyTracker {
        fn name(&self) -> &str {
            "flaky"
        }
        fn get_epic_children(&self, _epic_key: &str) -> Result<Vec<IssueData>, TrackerError> {
            Ok(Vec::new())
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
        fn update_issue_description(&self, key: &str, _content: &Value) -> Result<bool, TrackerError> {
            if key == self.missing {
                return Err(TrackerError::not_found(key, "issue does not exist"));
            }
            if key == self.locked {
                return Err(TrackerError::authentication("token expired"));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn create_subtask(&self, _r: &CreateSubtaskRequest) -> Result<Option<String>, TrackerError> {
            Ok(None)
        }
        fn update_subtask(&self, _key: &str, _u: &SubtaskUpdate) -> Result<bool, TrackerError> {
            Ok(true)
        }
        fn add_comment(&self, _key: &str, _body: &Value) -> Result<bool, TrackerError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn transition_issue(&self, _key: &str, _status: &str) -> Result<bool, TrackerError> {
            Ok(true)
        }
        fn get_available_transitions(&self, _key: &str) -> Result<Vec<Transition>, TrackerError> {
            Ok(Vec::new())
        }
    }

    fn batch(story: &str, key: &str) -> StoryBatch {
        let mut b = StoryBatch::new(StoryId::parse(story).unwrap(), key);
        b.push(PlannedCommand::new(
            UpdateDescriptionCommand::new(key, json!("new"), false),
            "story",
        ));
        b.push(PlannedCommand::new(
            AddCommentCommand::new(key, json!("note"), false),
            "story",
        ));
        b
    }

    fn run(
        tracker: &FlakyTracker,
        batches: &[StoryBatch],
        workers: Option<usize>,
        completed: &HashSet<String>,
    ) -> (ParallelSyncResult, usize) {
        let cancel = CancellationToken::new();
        let abort = AtomicBool::new(false);
        let seen = Mutex::new(0usize);
        let observer = |_: &ExecutedCommand| {
            *seen.lock().unwrap() += 1;
        };
        let ctx = BatchContext {
            tracker,
            completed,
            cancel: &cancel,
            abort: &abort,
            observer: &observer,
        };
        let result = match workers {
            Some(n) => execute_batches(&ctx, batches, n).unwrap(),
            None => execute_sequential(&ctx, batches),
        };
        let count = *seen.lock().unwrap();
        (result, count)
    }

    #[test]
    fn test_failure_does_not_stop_siblings() {
        let tracker = FlakyTracker::new("TEST-2", "none");
        let batches = vec![batch("US-001", "TEST-1"), batch("US-002", "TEST-2"), batch("US-003", "TEST-3")];

        let (result, observed) = run(&tracker, &batches, Some(3), &HashSet::new());
        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(result.outcomes[1].story_id.as_str(), "US-002");
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert!(result.fatal().is_none());
        // the failing batch still posts its comment
        assert_eq!(result.outcomes[1].executed.len(), 2);
        assert_eq!(observed, 6);
        assert_eq!(tracker.writes.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_authentication_failure_aborts_remaining_commands() {
        let tracker = FlakyTracker::new("none", "TEST-1");
        let batches = vec![batch("US-001", "TEST-1"), batch("US-002", "TEST-2")];

        let (result, _) = run(&tracker, &batches, None, &HashSet::new());
        assert!(result.fatal().is_some());
        assert_eq!(result.outcomes[0].executed.len(), 1);
        assert!(result.outcomes[1].aborted);
        assert!(result.outcomes[1].executed.is_empty());
        assert_eq!(tracker.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_completed_operations_are_skipped() {
        let tracker = FlakyTracker::new("none", "none");
        let batches = vec![batch("US-001", "TEST-1")];
        let done: HashSet<String> = batches[0]
            .commands
            .iter()
            .take(1)
            .map(|p| p.command.operation_id())
            .collect();

        let (result, _) = run(&tracker, &batches, None, &done);
        let statuses: Vec<_> = result.outcomes[0].executed.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![OperationStatus::Skipped, OperationStatus::Completed]);
        assert_eq!(tracker.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_batches_do_not_start() {
        let tracker = FlakyTracker::new("none", "none");
        let batches = vec![batch("US-001", "TEST-1")];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let abort = AtomicBool::new(false);
        let observer = |_: &ExecutedCommand| {};
        let completed = HashSet::new();
        let ctx = BatchContext {
            tracker: &tracker,
            completed: &completed,
            cancel: &cancel,
            abort: &abort,
            observer: &observer,
        };

        let result = execute_sequential(&ctx, &batches);
        assert!(result.outcomes[0].cancelled);
        assert_eq!(tracker.writes.load(Ordering::SeqCst), 0);
    }
}
