//! Interfaces to the systems the sync engine talks to.
//!
//! Concrete tracker adapters, markdown parsers and rich-text formatters live
//! outside this crate; the engine only ever sees these traits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use crate::domain::{Comment, Epic, Status, UserStory};
use crate::error::{ParserError, TrackerError};

/// Live state of a tracker issue, re-fetched on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueData {
    pub key: String,
    pub summary: String,
    /// Opaque body: markdown text or the tracker's rich format.
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Story ID recorded on the issue (custom field, label or task-list anchor).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subtasks: Vec<IssueData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<Comment>>,
}

impl IssueData {
    pub fn new(key: &str, summary: &str) -> Self {
        Self {
            key: key.to_string(),
            summary: summary.to_string(),
            description: None,
            status: String::new(),
            issue_type: String::new(),
            assignee: None,
            story_points: None,
            priority: None,
            story_id: None,
            updated_at: None,
            subtasks: Vec::new(),
            comments: None,
        }
    }

    /// Description flattened to text for comparison and display.
    pub fn description_text(&self) -> String {
        description_to_text(self.description.as_ref())
    }
}

/// Flatten an opaque description into a comparable string.
pub fn description_to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

/// True when two tracker status names denote the same workflow state.
pub fn statuses_equivalent(a: &str, b: &str) -> bool {
    if normalize_status(a) == normalize_status(b) {
        return true;
    }
    matches!((Status::parse(a), Status::parse(b)), (Some(x), Some(y)) if x == y)
}

fn normalize_status(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Request to create a sub-issue under a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubtaskRequest {
    pub parent_key: String,
    pub summary: String,
    pub description: Value,
    pub project_key: String,
    pub story_points: Option<f64>,
    pub assignee: Option<String>,
}

/// Partial update of an existing sub-issue; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskUpdate {
    pub summary: Option<String>,
    pub description: Option<Value>,
    pub story_points: Option<f64>,
    pub assignee: Option<String>,
}

impl SubtaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.description.is_none()
            && self.story_points.is_none()
            && self.assignee.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub name: String,
    pub to_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Blocks,
    IsBlockedBy,
    RelatesTo,
    Duplicates,
    DependsOn,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueLink {
    pub link_type: LinkType,
    pub target_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSyncOutcome {
    pub created: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Features an adapter declares; the engine branches on these, never on
/// tracker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerCapabilities {
    pub supports_native_links: bool,
    pub supports_subtasks: bool,
    pub supports_story_points: bool,
}

impl Default for TrackerCapabilities {
    fn default() -> Self {
        Self {
            supports_native_links: false,
            supports_subtasks: true,
            supports_story_points: true,
        }
    }
}

/// Workflow graph of allowed status hops.
///
/// Status names are matched case-insensitively. A permissive graph allows a
/// direct hop between any two statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    names: HashMap<String, String>,
    permissive: bool,
}

impl TransitionGraph {
    /// An empty graph: no transitions at all.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    pub fn from_map(map: &BTreeMap<String, Vec<String>>) -> Self {
        let mut graph = Self::new();
        for (from, targets) in map {
            for to in targets {
                graph.add_transition(from, to);
            }
        }
        graph
    }

    pub fn with_transition(mut self, from: &str, to: &str) -> Self {
        self.add_transition(from, to);
        self
    }

    pub fn add_transition(&mut self, from: &str, to: &str) {
        let from_key = normalize_status(from);
        let to_key = normalize_status(to);
        self.names.entry(from_key.clone()).or_insert_with(|| from.to_string());
        self.names.entry(to_key.clone()).or_insert_with(|| to.to_string());
        self.edges.entry(from_key).or_default().insert(to_key);
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    /// Number of distinct statuses known to the graph.
    pub fn status_count(&self) -> usize {
        self.names.len()
    }

    /// Shortest sequence of hops from `from` to `to`, excluding `from`.
    ///
    /// Returns an empty path when already at the target and `None` when the
    /// target is unreachable.
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if statuses_equivalent(from, to) {
            return Some(Vec::new());
        }
        if self.permissive {
            return Some(vec![to.to_string()]);
        }

        let start = self.resolve(from)?;
        let goal_matches = |node: &str| {
            let name = self.names.get(node).map(String::as_str).unwrap_or(node);
            statuses_equivalent(name, to)
        };

        let mut previous: HashMap<String, String> = HashMap::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back(start.clone());

        while let Some(node) = queue.pop_front() {
            if node != start && goal_matches(&node) {
                let mut path = vec![node.clone()];
                let mut cursor = node;
                while let Some(prev) = previous.get(&cursor) {
                    if *prev == start {
                        break;
                    }
                    path.push(prev.clone());
                    cursor = prev.clone();
                }
                path.reverse();
                return Some(
                    path.into_iter()
                        .map(|k| self.names.get(&k).cloned().unwrap_or(k))
                        .collect(),
                );
            }
            if let Some(next) = self.edges.get(&node) {
                for n in next {
                    if visited.insert(n.clone()) {
                        previous.insert(n.clone(), node.clone());
                        queue.push_back(n.clone());
                    }
                }
            }
        }
        None
    }

    fn resolve(&self, status: &str) -> Option<String> {
        let key = normalize_status(status);
        if self.names.contains_key(&key) {
            return Some(key);
        }
        self.names
            .iter()
            .find(|(_, name)| statuses_equivalent(name, status))
            .map(|(k, _)| k.clone())
    }
}

/// Port to an external issue tracker (Jira, GitHub, GitLab, Linear, ...).
///
/// Every write honours the dry-run flag the adapter was constructed with.
/// Implementations map their transport failures onto [`TrackerError`].
pub trait IssueTrackerPort: Send + Sync {
    /// Tracker type, recorded in sync history (`"jira"`, `"github"`, ...).
    fn name(&self) -> &str;

    fn capabilities(&self) -> TrackerCapabilities {
        TrackerCapabilities::default()
    }

    /// Workflow used to walk status transitions.
    fn transition_graph(&self) -> TransitionGraph {
        TransitionGraph::permissive()
    }

    fn get_epic_children(&self, epic_key: &str) -> Result<Vec<IssueData>, TrackerError>;

    fn get_issue(&self, key: &str) -> Result<IssueData, TrackerError>;

    fn get_issue_comments(&self, key: &str) -> Result<Vec<Comment>, TrackerError>;

    fn get_issue_status(&self, key: &str) -> Result<String, TrackerError>;

    fn update_issue_description(&self, key: &str, content: &Value) -> Result<bool, TrackerError>;

    /// Returns the key of the created sub-issue, if the tracker reports one.
    fn create_subtask(&self, request: &CreateSubtaskRequest)
        -> Result<Option<String>, TrackerError>;

    fn update_subtask(&self, key: &str, update: &SubtaskUpdate) -> Result<bool, TrackerError>;

    fn add_comment(&self, key: &str, body: &Value) -> Result<bool, TrackerError>;

    fn transition_issue(&self, key: &str, target_status: &str) -> Result<bool, TrackerError>;

    fn get_available_transitions(&self, key: &str) -> Result<Vec<Transition>, TrackerError>;

    fn get_issue_links(&self, _key: &str) -> Result<Vec<IssueLink>, TrackerError> {
        Ok(Vec::new())
    }

    fn create_link(
        &self,
        _source_key: &str,
        _link: &IssueLink,
    ) -> Result<bool, TrackerError> {
        Ok(false)
    }

    fn delete_link(
        &self,
        _source_key: &str,
        _link: &IssueLink,
    ) -> Result<bool, TrackerError> {
        Ok(false)
    }

    /// Bring the links of `key` in line with `desired`.
    fn sync_links(
        &self,
        key: &str,
        desired: &[IssueLink],
    ) -> Result<LinkSyncOutcome, TrackerError> {
        let mut outcome = LinkSyncOutcome::default();
        if !self.capabilities().supports_native_links {
            return Ok(outcome);
        }

        let existing = self.get_issue_links(key)?;
        for link in desired {
            if existing.contains(link) {
                outcome.unchanged += 1;
            } else if self.create_link(key, link)? {
                outcome.created += 1;
            }
        }
        for link in &existing {
            if !desired.contains(link) && self.delete_link(key, link)? {
                outcome.deleted += 1;
            }
        }
        Ok(outcome)
    }
}

/// Port to the markdown (or YAML, Notion, ...) story source.
pub trait DocumentParserPort: Send + Sync {
    fn parse_stories(&self, path: &Path) -> Result<Vec<UserStory>, ParserError>;

    /// Stories grouped by epic. Single-epic documents yield one un-keyed epic.
    fn parse_epics(&self, path: &Path) -> Result<Vec<Epic>, ParserError> {
        let stories = self.parse_stories(path)?;
        Ok(vec![Epic::new(None, "", stories)])
    }
}

/// Converts markdown into the tracker's native rich content.
pub trait DocumentFormatterPort: Send + Sync {
    fn format_text(&self, markdown: &str) -> Value;
}

/// Writes stories back into the source document (pull direction only).
pub trait DocumentWriterPort: Send + Sync {
    fn write_stories(&self, path: &Path, stories: &[UserStory]) -> anyhow::Result<()>;
}
