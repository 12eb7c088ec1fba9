use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{Priority, Status};
use super::value_objects::{AcceptanceCriteria, IssueKey, StoryDescription, StoryId};

/// A comment attached to a story or tracker issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn new(body: &str) -> Self {
        Self {
            id: None,
            body: body.to_string(),
            author: None,
            created_at: None,
        }
    }
}

/// Child unit of work of a story. Position inside the parent story matters
/// for matching against tracker sub-issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<f64>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl Subtask {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            story_points: None,
            completed: false,
            assignee: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_points(mut self, points: f64) -> Self {
        self.story_points = Some(points);
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// A user story parsed from the markdown document.
///
/// A fresh set of stories is produced by every parse; nothing here outlives
/// a single sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStory {
    pub id: StoryId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<StoryDescription>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<f64>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub acceptance_criteria: AcceptanceCriteria,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl UserStory {
    pub fn new(id: StoryId, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            description: None,
            status: Status::default(),
            priority: Priority::default(),
            story_points: None,
            subtasks: Vec::new(),
            acceptance_criteria: AcceptanceCriteria::default(),
            comments: Vec::new(),
            assignee: None,
        }
    }

    /// Markdown body sent to the tracker: description followed by the
    /// acceptance criteria checklist when present.
    pub fn description_markdown(&self) -> Option<String> {
        let description = self
            .description
            .as_ref()
            .filter(|d| !d.is_empty())
            .map(|d| d.to_markdown());

        match (description, self.acceptance_criteria.is_empty()) {
            (None, true) => None,
            (Some(d), true) => Some(d),
            (d, false) => {
                let mut out = d.unwrap_or_default();
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str("### Acceptance Criteria\n");
                out.push_str(&self.acceptance_criteria.to_markdown());
                Some(out)
            }
        }
    }

    pub fn total_subtask_points(&self) -> f64 {
        self.subtasks.iter().filter_map(|s| s.story_points).sum()
    }
}

/// Top-level grouping of stories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<IssueKey>,
    pub title: String,
    #[serde(default)]
    pub stories: Vec<UserStory>,
}

impl Epic {
    pub fn new(key: Option<IssueKey>, title: &str, stories: Vec<UserStory>) -> Self {
        Self {
            key,
            title: title.to_string(),
            stories,
        }
    }

    pub fn find_story(&self, id: &StoryId) -> Option<&UserStory> {
        self.stories.iter().find(|s| &s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Description;

    fn story() -> UserStory {
        UserStory::new(StoryId::parse("US-001").unwrap(), "Story Alpha")
    }

    #[test]
    fn test_description_markdown_none_when_empty() {
        assert!(story().description_markdown().is_none());
    }

    #[test]
    fn test_description_markdown_with_criteria() {
        let mut s = story();
        s.description = Some(StoryDescription::Structured(Description::new(
            "user", "x", "y",
        )));
        s.acceptance_criteria = AcceptanceCriteria::from_items(["works"]);
        let md = s.description_markdown().unwrap();
        assert!(md.starts_with("**As a** user"));
        assert!(md.contains("### Acceptance Criteria\n- [ ] works"));
    }

    #[test]
    fn test_total_subtask_points() {
        let mut s = story();
        s.subtasks.push(Subtask::new("a").with_points(2.0));
        s.subtasks.push(Subtask::new("b"));
        s.subtasks.push(Subtask::new("c").with_points(3.0));
        assert_eq!(s.total_subtask_points(), 5.0);
    }
}
