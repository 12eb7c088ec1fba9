//! Every tracker mutation is a [`Command`]: a self-contained, loggable unit
//! whose dry-run flag is fixed at construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sha256_hex;
use crate::error::{ErrorKind, TrackerError};
use crate::ports::{
    description_to_text, statuses_equivalent, CreateSubtaskRequest, IssueTrackerPort,
    SubtaskUpdate, TransitionGraph,
};

/// Upper bound on status hops for one transition command.
pub const MAX_TRANSITION_HOPS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    UpdateDescription,
    CreateSubtask,
    UpdateSubtask,
    AddComment,
    TransitionStatus,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::UpdateDescription => "update_description",
            CommandKind::CreateSubtask => "create_subtask",
            CommandKind::UpdateSubtask => "update_subtask",
            CommandKind::AddComment => "add_comment",
            CommandKind::TransitionStatus => "transition_status",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    /// Key of an issue the command created
    pub created_key: Option<String>,
    pub dry_run: bool,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            created_key: None,
            dry_run: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(message)
        }
    }

    pub fn simulated(message: impl Into<String>) -> Self {
        Self {
            dry_run: true,
            ..Self::ok(format!("[DRY-RUN] {}", message.into()))
        }
    }
}

/// A mutating tracker call.
///
/// `execute` never consults global state; a dry-run command returns a
/// simulated success without calling any tracker write.
pub trait Command: Send + Sync {
    fn kind(&self) -> CommandKind;

    fn target_key(&self) -> &str;

    /// Deterministic identity, stable across runs, used to skip work that a
    /// resumed session already completed.
    fn operation_id(&self) -> String;

    fn describe(&self) -> String;

    fn is_dry_run(&self) -> bool;

    fn execute(&self, tracker: &dyn IssueTrackerPort) -> Result<CommandResult, TrackerError>;
}

fn short_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())[..12].to_string()
}

pub struct UpdateDescriptionCommand {
    pub issue_key: String,
    pub description: Value,
    pub dry_run: bool,
}

impl UpdateDescriptionCommand {
    pub fn new(issue_key: &str, description: Value, dry_run: bool) -> Self {
        Self {
            issue_key: issue_key.to_string(),
            description,
            dry_run,
        }
    }
}

impl Command for UpdateDescriptionCommand {
    fn kind(&self) -> CommandKind {
        CommandKind::UpdateDescription
    }

    fn target_key(&self) -> &str {
        &self.issue_key
    }

    fn operation_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind(),
            self.issue_key,
            short_hash(&description_to_text(Some(&self.description)))
        )
    }

    fn describe(&self) -> String {
        format!("Update description of {}", self.issue_key)
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, tracker: &dyn IssueTrackerPort) -> Result<CommandResult, TrackerError> {
        if self.dry_run {
            return Ok(CommandResult::simulated(self.describe()));
        }
        if tracker.update_issue_description(&self.issue_key, &self.description)? {
            Ok(CommandResult::ok(format!("Updated description of {}", self.issue_key)))
        } else {
            Ok(CommandResult::failed(format!(
                "Tracker rejected description update for {}",
                self.issue_key
            )))
        }
    }
}

pub struct CreateSubtaskCommand {
    pub request: CreateSubtaskRequest,
    pub dry_run: bool,
}

impl CreateSubtaskCommand {
    pub fn new(request: CreateSubtaskRequest, dry_run: bool) -> Self {
        Self { request, dry_run }
    }
}

impl Command for CreateSubtaskCommand {
    fn kind(&self) -> CommandKind {
        CommandKind::CreateSubtask
    }

    fn target_key(&self) -> &str {
        &self.request.parent_key
    }

    fn operation_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind(),
            self.request.parent_key,
            short_hash(&self.request.summary.to_lowercase())
        )
    }

    fn describe(&self) -> String {
        format!(
            "Create subtask '{}' under {}",
            self.request.summary, self.request.parent_key
        )
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, tracker: &dyn IssueTrackerPort) -> Result<CommandResult, TrackerError> {
        if self.dry_run {
            return Ok(CommandResult::simulated(self.describe()));
        }
        match tracker.create_subtask(&self.request)? {
            Some(key) => Ok(CommandResult {
                created_key: Some(key.clone()),
                ..CommandResult::ok(format!(
                    "Created subtask {} '{}'",
                    key, self.request.summary
                ))
            }),
            None => Ok(CommandResult::failed(format!(
                "Tracker did not create subtask '{}' under {}",
                self.request.summary, self.request.parent_key
            ))),
        }
    }
}

pub struct UpdateSubtaskCommand {
    pub issue_key: String,
    pub update: SubtaskUpdate,
    pub dry_run: bool,
}

impl UpdateSubtaskCommand {
    pub fn new(issue_key: &str, update: SubtaskUpdate, dry_run: bool) -> Self {
        Self {
            issue_key: issue_key.to_string(),
            update,
            dry_run,
        }
    }

    fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.update.summary.is_some() {
            fields.push("summary");
        }
        if self.update.description.is_some() {
            fields.push("description");
        }
        if self.update.story_points.is_some() {
            fields.push("story points");
        }
        if self.update.assignee.is_some() {
            fields.push("assignee");
        }
        fields
    }
}

impl Command for UpdateSubtaskCommand {
    fn kind(&self) -> CommandKind {
        CommandKind::UpdateSubtask
    }

    fn target_key(&self) -> &str {
        &self.issue_key
    }

    fn operation_id(&self) -> String {
        let payload = serde_json::to_string(&self.update).unwrap_or_default();
        format!("{}:{}:{}", self.kind(), self.issue_key, short_hash(&payload))
    }

    fn describe(&self) -> String {
        format!(
            "Update subtask {} ({})",
            self.issue_key,
            self.changed_fields().join(", ")
        )
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, tracker: &dyn IssueTrackerPort) -> Result<CommandResult, TrackerError> {
        if self.dry_run {
            return Ok(CommandResult::simulated(self.describe()));
        }
        if tracker.update_subtask(&self.issue_key, &self.update)? {
            Ok(CommandResult::ok(format!("Updated subtask {}", self.issue_key)))
        } else {
            Ok(CommandResult::failed(format!(
                "Tracker rejected update of subtask {}",
                self.issue_key
            )))
        }
    }
}

pub struct AddCommentCommand {
    pub issue_key: String,
    pub body: Value,
    pub dry_run: bool,
}

impl AddCommentCommand {
    pub fn new(issue_key: &str, body: Value, dry_run: bool) -> Self {
        Self {
            issue_key: issue_key.to_string(),
            body,
            dry_run,
        }
    }
}

impl Command for AddCommentCommand {
    fn kind(&self) -> CommandKind {
        CommandKind::AddComment
    }

    fn target_key(&self) -> &str {
        &self.issue_key
    }

    fn operation_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind(),
            self.issue_key,
            short_hash(&description_to_text(Some(&self.body)))
        )
    }

    fn describe(&self) -> String {
        format!("Add comment to {}", self.issue_key)
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, tracker: &dyn IssueTrackerPort) -> Result<CommandResult, TrackerError> {
        if self.dry_run {
            return Ok(CommandResult::simulated(self.describe()));
        }
        if tracker.add_comment(&self.issue_key, &self.body)? {
            Ok(CommandResult::ok(format!("Added comment to {}", self.issue_key)))
        } else {
            Ok(CommandResult::failed(format!(
                "Tracker rejected comment on {}",
                self.issue_key
            )))
        }
    }
}

/// Walks the workflow graph one transition at a time.
///
/// The current status is re-read after every hop and the remaining path
/// re-planned from wherever the issue actually landed. When no path exists
/// the command fails without issuing any transition.
pub struct TransitionStatusCommand {
    pub issue_key: String,
    pub target_status: String,
    pub graph: TransitionGraph,
    pub dry_run: bool,
    pub max_hops: usize,
}

impl TransitionStatusCommand {
    pub fn new(issue_key: &str, target_status: &str, graph: TransitionGraph, dry_run: bool) -> Self {
        Self {
            issue_key: issue_key.to_string(),
            target_status: target_status.to_string(),
            graph,
            dry_run,
            max_hops: MAX_TRANSITION_HOPS,
        }
    }

    fn no_path(&self, current: &str) -> CommandResult {
        CommandResult::failed(format!(
            "No transition path for {} from '{}' to '{}'",
            self.issue_key, current, self.target_status
        ))
    }
}

impl Command for TransitionStatusCommand {
    fn kind(&self) -> CommandKind {
        CommandKind::TransitionStatus
    }

    fn target_key(&self) -> &str {
        &self.issue_key
    }

    fn operation_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind(),
            self.issue_key,
            self.target_status.to_lowercase()
        )
    }

    fn describe(&self) -> String {
        format!("Transition {} to '{}'", self.issue_key, self.target_status)
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, tracker: &dyn IssueTrackerPort) -> Result<CommandResult, TrackerError> {
        let mut current = tracker.get_issue_status(&self.issue_key)?;
        if statuses_equivalent(&current, &self.target_status) {
            return Ok(CommandResult::ok(format!(
                "{} already in '{}'",
                self.issue_key, current
            )));
        }

        let Some(plan) = self.graph.find_path(&current, &self.target_status) else {
            return Ok(self.no_path(&current));
        };
        if self.dry_run {
            return Ok(CommandResult::simulated(format!(
                "{} via {}",
                self.describe(),
                plan.join(" -> ")
            )));
        }

        let mut hops = Vec::new();
        while !statuses_equivalent(&current, &self.target_status) {
            if hops.len() >= self.max_hops {
                return Ok(CommandResult::failed(format!(
                    "Gave up transitioning {} after {} hops (now '{}')",
                    self.issue_key,
                    hops.len(),
                    current
                )));
            }
            let Some(next) = self
                .graph
                .find_path(&current, &self.target_status)
                .and_then(|path| path.into_iter().next())
            else {
                return Ok(self.no_path(&current));
            };

            if !tracker.transition_issue(&self.issue_key, &next)? {
                return Ok(CommandResult::failed(format!(
                    "Transition of {} to '{}' was rejected",
                    self.issue_key, next
                )));
            }
            log::debug!("{} moved to '{}'", self.issue_key, next);
            hops.push(next);
            current = tracker.get_issue_status(&self.issue_key)?;
        }

        Ok(CommandResult::ok(format!(
            "Transitioned {} to '{}' via {}",
            self.issue_key,
            current,
            hops.join(" -> ")
        )))
    }
}

/// A command that did not succeed; never aborts the batch on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation_id: String,
    pub kind: CommandKind,
    pub target_key: String,
    pub description: String,
    pub error: String,
    pub error_kind: Option<ErrorKind>,
}

impl FailedOperation {
    pub fn from_error(command: &dyn Command, error: &TrackerError) -> Self {
        Self {
            operation_id: command.operation_id(),
            kind: command.kind(),
            target_key: command.target_key().to_string(),
            description: command.describe(),
            error: error.to_string(),
            error_kind: Some(error.kind()),
        }
    }

    pub fn from_result(command: &dyn Command, result: &CommandResult) -> Self {
        Self {
            operation_id: command.operation_id(),
            kind: command.kind(),
            target_key: command.target_key().to_string(),
            description: command.describe(),
            error: result.message.clone(),
            error_kind: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Comment;
    use crate::ports::{IssueData, Transition};
    use std::sync::Mutex;

    /// Tracker whose status moves with each transition call.
    struct WorkflowTracker {
        status: Mutex<String>,
        transitions: Mutex<Vec<String>>,
        writes: Mutex<usize>,
    }

    impl WorkflowTracker {
        fn at(status: &str) -> Self {
            Self {
                status: Mutex::new(status.to_string()),
                transitions: Mutex::new(Vec::new()),
                writes: Mutex::new(0),
            }
        }

        fn write(&self) {
            *self.writes.lock().unwrap() += 1;
        }
    }

    impl IssueTrackerPort for WorkflowTracker {
        fn name(&self) -> &str {
            "workflow"
        }
        fn get_epic_children(&self, _: &str) -> Result<Vec<IssueData>, TrackerError> {
            Ok(Vec::new())
        }
        fn get_issue(&self, key: &str) -> Result<IssueData, TrackerError> {
            Ok(IssueData::new(key, ""))
        }
        fn get_issue_comments(&self, _: &str) -> Result<Vec<Comment>, TrackerError> {
            Ok(Vec::new())
        }
        fn get_issue_status(&self, _: &str) -> Result<String, TrackerError> {
            Ok(self.status.lock().unwrap().clone())
        }
        fn update_issue_description(&self, _: &str, _: &Value) -> Result<bool, TrackerError> {
            self.write();
            Ok(true)
        }
        fn create_subtask(&self, _: &CreateSubtaskRequest) -> Result<Option<String>, TrackerError> {
            self.write();
            Ok(Some("TEST-99".into()))
        }
        fn update_subtask(&self, _: &str, _: &SubtaskUpdate) -> Result<bool, TrackerError> {
            self.write();
            Ok(true)
        }
        fn add_comment(&self, _: &str, _: &Value) -> Result<bool, TrackerError> {
            self.write();
            Ok(true)
        }
        fn transition_issue(&self, _: &str, target: &str) -> Result<bool, TrackerError> {
            self.write();
            self.transitions.lock().unwrap().push(target.to_string());
            *self.status.lock().unwrap() = target.to_string();
            Ok(true)
        }
        fn get_available_transitions(&self, _: &str) -> Result<Vec<Transition>, TrackerError> {
            Ok(Vec::new())
        }
    }

    fn workflow() -> TransitionGraph {
        TransitionGraph::new()
            .with_transition("To Do", "In Progress")
            .with_transition("In Progress", "Done")
    }

    #[test]
    fn test_transition_walks_each_hop() {
        let tracker = WorkflowTracker::at("To Do");
        let cmd = TransitionStatusCommand::new("TEST-1", "Done", workflow(), false);

        let result = cmd.execute(&tracker).unwrap();

        assert!(result.success, "{}", result.message);
        assert_eq!(*tracker.transitions.lock().unwrap(), vec!["In Progress", "Done"]);
    }

    #[test]
    fn test_transition_without_path_issues_no_calls() {
        let tracker = WorkflowTracker::at("Done");
        let cmd = TransitionStatusCommand::new("TEST-1", "To Do", workflow(), false);

        let result = cmd.execute(&tracker).unwrap();

        assert!(!result.success);
        assert!(result.message.contains("No transition path"));
        assert_eq!(*tracker.writes.lock().unwrap(), 0);
    }

    #[test]
    fn test_transition_already_at_target() {
        let tracker = WorkflowTracker::at("done");
        let cmd = TransitionStatusCommand::new("TEST-1", "Done", workflow(), false);
        assert!(cmd.execute(&tracker).unwrap().success);
        assert_eq!(*tracker.writes.lock().unwrap(), 0);
    }

    #[test]
    fn test_dry_run_commands_never_write() {
        let tracker = WorkflowTracker::at("To Do");
        let request = CreateSubtaskRequest {
            parent_key: "TEST-1".into(),
            summary: "Sub".into(),
            description: Value::Null,
            project_key: "TEST".into(),
            story_points: None,
            assignee: None,
        };
        let commands: Vec<Box<dyn Command>> = vec![
            Box::new(UpdateDescriptionCommand::new("TEST-1", Value::from("d"), true)),
            Box::new(CreateSubtaskCommand::new(request, true)),
            Box::new(UpdateSubtaskCommand::new(
                "TEST-2",
                SubtaskUpdate {
                    summary: Some("x".into()),
                    ..SubtaskUpdate::default()
                },
                true,
            )),
            Box::new(AddCommentCommand::new("TEST-1", Value::from("c"), true)),
            Box::new(TransitionStatusCommand::new("TEST-1", "Done", workflow(), true)),
        ];

        for cmd in &commands {
            let result = cmd.execute(&tracker).unwrap();
            assert!(result.success && result.dry_run, "{}", cmd.describe());
        }
        assert_eq!(*tracker.writes.lock().unwrap(), 0);
    }

    #[test]
    fn test_operation_ids_are_deterministic() {
        let a = AddCommentCommand::new("TEST-1", Value::from("hello"), false);
        let b = AddCommentCommand::new("TEST-1", Value::from("hello"), true);
        let c = AddCommentCommand::new("TEST-1", Value::from("other"), false);
        assert_eq!(a.operation_id(), b.operation_id());
        assert_ne!(a.operation_id(), c.operation_id());
        assert!(a.operation_id().starts_with("add_comment:TEST-1:"));
    }

    #[test]
    fn test_create_subtask_reports_key() {
        let tracker = WorkflowTracker::at("To Do");
        let request = CreateSubtaskRequest {
            parent_key: "TEST-1".into(),
            summary: "Sub".into(),
            description: Value::Null,
            project_key: "TEST".into(),
            story_points: Some(2.0),
            assignee: None,
        };
        let result = CreateSubtaskCommand::new(request, false).execute(&tracker).unwrap();
        assert_eq!(result.created_key.as_deref(), Some("TEST-99"));
    }
}
