//! In-memory ports shared by the integration tests.

#![allow(dead_code)]

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use storysync::domain::{Comment, Epic, IssueKey, StoryDescription, StoryId, Subtask, UserStory};
use storysync::error::{ParserError, TrackerError};
use storysync::ports::{
    CreateSubtaskRequest, DocumentFormatterPort, DocumentParserPort, DocumentWriterPort,
    IssueData, IssueTrackerPort, SubtaskUpdate, Transition,
};

pub const EPIC: &str = "TEST-1";

/// Counts every port call so tests can assert on exact write volume.
#[derive(Default)]
pub struct Calls {
    pub epic_reads: AtomicUsize,
    pub comment_reads: AtomicUsize,
    pub description_updates: AtomicUsize,
    pub subtasks_created: AtomicUsize,
    pub subtasks_updated: AtomicUsize,
    pub comments_added: AtomicUsize,
    pub transitions: AtomicUsize,
}

impl Calls {
    pub fn writes(&self) -> usize {
        [
            &self.description_updates,
            &self.subtasks_created,
            &self.subtasks_updated,
            &self.comments_added,
            &self.transitions,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// Issue tracker backed by a map of epic key to child issues.
///
/// Writes mutate the stored issues, so a second sync sees the first one's
/// effects.
#[derive(Default)]
pub struct MockTracker {
    epics: Mutex<BTreeMap<String, Vec<IssueData>>>,
    comments: Mutex<BTreeMap<String, Vec<Comment>>>,
    missing: Mutex<HashSet<String>>,
    revoked: Mutex<HashSet<String>>,
    locked_epics: Mutex<HashSet<String>>,
    next_key: AtomicUsize,
    pub calls: Calls,
}

impl MockTracker {
    pub fn new() -> Self {
        Self {
            next_key: AtomicUsize::new(100),
            ..Self::default()
        }
    }

    pub fn with_epic(self, epic_key: &str, issues: Vec<IssueData>) -> Self {
        self.epics
            .lock()
            .unwrap()
            .insert(epic_key.to_string(), issues);
        self
    }

    /// Writes to `key` fail with "resource not found".
    pub fn missing(self, key: &str) -> Self {
        self.missing.lock().unwrap().insert(key.to_string());
        self
    }

    /// Writes to `key` fail with an authentication error.
    pub fn revoked(self, key: &str) -> Self {
        self.revoked.lock().unwrap().insert(key.to_string());
        self
    }

    /// Reading the children of `epic_key` fails with an authentication error.
    pub fn locked_epic(self, epic_key: &str) -> Self {
        self.locked_epics
            .lock()
            .unwrap()
            .insert(epic_key.to_string());
        self
    }

    pub fn with_comment(self, key: &str, body: &str) -> Self {
        self.comments
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(Comment::new(body));
        self
    }

    pub fn issue(&self, key: &str) -> Option<IssueData> {
        let epics = self.epics.lock().unwrap();
        epics
            .values()
            .flatten()
            .flat_map(|i| std::iter::once(i).chain(i.subtasks.iter()))
            .find(|i| i.key == key)
            .cloned()
    }

    pub fn edit(&self, key: &str, f: impl FnOnce(&mut IssueData)) {
        let mut epics = self.epics.lock().unwrap();
        if let Some(issue) = find_mut(&mut epics, key) {
            f(issue);
        }
    }

    pub fn comments_on(&self, key: &str) -> Vec<Comment> {
        self.comments
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn check_write(&self, key: &str) -> Result<(), TrackerError> {
        if self.revoked.lock().unwrap().contains(key) {
            return Err(TrackerError::authentication("token revoked"));
        }
        if self.missing.lock().unwrap().contains(key) {
            return Err(TrackerError::not_found(key, format!("Issue {key} does not exist")));
        }
        Ok(())
    }
}

fn find_mut<'a>(
    epics: &'a mut BTreeMap<String, Vec<IssueData>>,
    key: &str,
) -> Option<&'a mut IssueData> {
    for issue in epics.values_mut().flatten() {
        if issue.key == key {
            return Some(issue);
        }
        if let Some(sub) = issue.subtasks.iter_mut().find(|s| s.key == key) {
            return Some(sub);
        }
    }
    None
}

impl IssueTrackerPort for MockTracker {
    fn name(&self) -> &str {
        "mock"
    }

    fn get_epic_children(&self, epic_key: &str) -> Result<Vec<IssueData>, TrackerError> {
        self.calls.epic_reads.fetch_add(1, Ordering::SeqCst);
        if self.locked_epics.lock().unwrap().contains(epic_key) {
            return Err(TrackerError::authentication("token expired"));
        }
        Ok(self
            .epics
            .lock()
            .unwrap()
            .get(epic_key)
            .cloned()
            .unwrap_or_default())
    }

    fn get_issue(&self, key: &str) -> Result<IssueData, TrackerError> {
        self.issue(key)
            .ok_or_else(|| TrackerError::not_found(key, "no such issue"))
    }

    fn get_issue_comments(&self, key: &str) -> Result<Vec<Comment>, TrackerError> {
        self.calls.comment_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.comments_on(key))
    }

    fn get_issue_status(&self, key: &str) -> Result<String, TrackerError> {
        self.issue(key)
            .map(|i| i.status)
            .ok_or_else(|| TrackerError::not_found(key, "no such issue"))
    }

    fn update_issue_description(&self, key: &str, content: &Value) -> Result<bool, TrackerError> {
        self.check_write(key)?;
        self.calls.description_updates.fetch_add(1, Ordering::SeqCst);
        self.edit(key, |issue| issue.description = Some(content.clone()));
        Ok(true)
    }

    fn create_subtask(
        &self,
        request: &CreateSubtaskRequest,
    ) -> Result<Option<String>, TrackerError> {
        self.check_write(&request.parent_key)?;
        self.calls.subtasks_created.fetch_add(1, Ordering::SeqCst);
        let key = format!(
            "{}-{}",
            request.project_key,
            self.next_key.fetch_add(1, Ordering::SeqCst)
        );
        let mut subtask = IssueData::new(&key, &request.summary);
        subtask.description = Some(request.description.clone());
        subtask.status = "To Do".to_string();
        subtask.story_points = request.story_points;
        self.edit(&request.parent_key, |parent| parent.subtasks.push(subtask));
        Ok(Some(key))
    }

    fn update_subtask(&self, key: &str, update: &SubtaskUpdate) -> Result<bool, TrackerError> {
        self.check_write(key)?;
        self.calls.subtasks_updated.fetch_add(1, Ordering::SeqCst);
        self.edit(key, |issue| {
            if let Some(summary) = &update.summary {
                issue.summary = summary.clone();
            }
            if let Some(description) = &update.description {
                issue.description = Some(description.clone());
            }
            if update.story_points.is_some() {
                issue.story_points = update.story_points;
            }
        });
        Ok(true)
    }

    fn add_comment(&self, key: &str, body: &Value) -> Result<bool, TrackerError> {
        self.check_write(key)?;
        self.calls.comments_added.fetch_add(1, Ordering::SeqCst);
        let text = body.as_str().unwrap_or_default();
        self.comments
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(Comment::new(text));
        Ok(true)
    }

    fn transition_issue(&self, key: &str, target_status: &str) -> Result<bool, TrackerError> {
        self.check_write(key)?;
        self.calls.transitions.fetch_add(1, Ordering::SeqCst);
        self.edit(key, |issue| issue.status = target_status.to_string());
        Ok(true)
    }

    fn get_available_transitions(&self, _key: &str) -> Result<Vec<Transition>, TrackerError> {
        Ok(Vec::new())
    }
}

/// Parser returning a fixed set of stories, whatever the path.
pub struct MockParser {
    stories: Mutex<Vec<UserStory>>,
    sections: Option<Vec<Epic>>,
    fail: bool,
}

impl MockParser {
    pub fn new(stories: Vec<UserStory>) -> Self {
        Self {
            stories: Mutex::new(stories),
            sections: None,
            fail: false,
        }
    }

    /// A document split into one section per epic key.
    pub fn with_sections(sections: Vec<(&str, Vec<UserStory>)>) -> Self {
        let epics: Vec<Epic> = sections
            .into_iter()
            .map(|(key, stories)| Epic::new(Some(IssueKey::parse(key).unwrap()), key, stories))
            .collect();
        Self {
            stories: Mutex::new(epics.iter().flat_map(|e| e.stories.clone()).collect()),
            sections: Some(epics),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            stories: Mutex::new(Vec::new()),
            sections: None,
            fail: true,
        }
    }

    pub fn edit(&self, f: impl FnOnce(&mut Vec<UserStory>)) {
        f(&mut self.stories.lock().unwrap());
    }
}

impl DocumentParserPort for MockParser {
    fn parse_stories(&self, path: &Path) -> Result<Vec<UserStory>, ParserError> {
        if self.fail {
            return Err(ParserError::new(path, "unterminated story block").at_line(12));
        }
        Ok(self.stories.lock().unwrap().clone())
    }

    fn parse_epics(&self, path: &Path) -> Result<Vec<Epic>, ParserError> {
        match &self.sections {
            Some(sections) => Ok(sections.clone()),
            None => Ok(vec![Epic::new(None, "", self.parse_stories(path)?)]),
        }
    }
}

/// Formatter that keeps markdown as a plain string.
pub struct PassthroughFormatter;

impl DocumentFormatterPort for PassthroughFormatter {
    fn format_text(&self, markdown: &str) -> Value {
        Value::String(markdown.to_string())
    }
}

/// Writer that remembers what it was asked to write.
#[derive(Default)]
pub struct MemoryWriter {
    pub written: Mutex<Option<(PathBuf, Vec<UserStory>)>>,
}

impl DocumentWriterPort for MemoryWriter {
    fn write_stories(&self, path: &Path, stories: &[UserStory]) -> anyhow::Result<()> {
        *self.written.lock().unwrap() = Some((path.to_path_buf(), stories.to_vec()));
        Ok(())
    }
}

pub fn story(id: &str, title: &str, description: &str) -> UserStory {
    let mut story = UserStory::new(StoryId::parse(id).unwrap(), title);
    story.description = Some(StoryDescription::Text(description.to_string()));
    story
}

pub fn issue(key: &str, summary: &str, status: &str) -> IssueData {
    let mut issue = IssueData::new(key, summary);
    issue.status = status.to_string();
    issue
}

/// Two stories against two issues: US-001 has a subtask the tracker lacks,
/// US-002's subtask exists but carries an outdated description.
pub fn fixture_stories() -> Vec<UserStory> {
    let mut alpha = story("US-001", "Story Alpha", "Alpha description");
    alpha.subtasks.push(Subtask::new("Alpha Subtask").with_description("Alpha work"));

    let mut beta = story("US-002", "Story Beta", "Beta description");
    beta.subtasks
        .push(Subtask::new("Beta Subtask").with_description("New beta details"));

    vec![alpha, beta]
}

pub fn fixture_issues() -> Vec<IssueData> {
    let alpha = issue("TEST-10", "US-001: Story Alpha", "Backlog");

    let mut beta = issue("TEST-11", "US-002: Story Beta", "Backlog");
    let mut beta_sub = issue("TEST-12", "Beta Subtask", "To Do");
    beta_sub.description = Some(Value::String("Old beta details".to_string()));
    beta.subtasks.push(beta_sub);

    vec![alpha, beta]
}

pub fn fixture_tracker() -> MockTracker {
    MockTracker::new().with_epic(EPIC, fixture_issues())
}
