use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow status of a story or subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Planned,
    Open,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

impl Status {
    /// Parse a status leniently.
    ///
    /// Case, whitespace, hyphens and underscores are ignored, and the common
    /// tracker spellings are accepted ("To Do", "closed", "resolved", ...).
    pub fn parse(value: &str) -> Option<Self> {
        let key: String = value
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        match key.as_str() {
            "planned" | "backlog" | "notstarted" => Some(Status::Planned),
            "open" | "todo" | "new" | "ready" => Some(Status::Open),
            "inprogress" | "active" | "started" | "doing" => Some(Status::InProgress),
            "inreview" | "review" | "codereview" | "testing" | "qa" => Some(Status::InReview),
            "done" | "closed" | "resolved" | "complete" | "completed" => Some(Status::Done),
            "cancelled" | "canceled" | "wontdo" | "wontfix" => Some(Status::Cancelled),
            _ => None,
        }
    }

    /// Name used when asking a tracker to transition to this status.
    pub fn tracker_name(&self) -> &'static str {
        match self {
            Status::Planned => "Backlog",
            Status::Open => "To Do",
            Status::InProgress => "In Progress",
            Status::InReview => "In Review",
            Status::Done => "Done",
            Status::Cancelled => "Cancelled",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Status::Done | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tracker_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "critical" | "blocker" | "highest" | "p0" => Some(Priority::Critical),
            "high" | "major" | "p1" => Some(Priority::High),
            "medium" | "normal" | "p2" => Some(Priority::Medium),
            "low" | "minor" | "lowest" | "trivial" | "p3" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "Critical",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        }
    }
}

/// Kind of tracker issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Epic,
    Story,
    Task,
    Subtask,
    Bug,
}

impl IssueType {
    pub fn parse(value: &str) -> Option<Self> {
        let key: String = value
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "epic" => Some(IssueType::Epic),
            "story" | "userstory" => Some(IssueType::Story),
            "task" => Some(IssueType::Task),
            "subtask" => Some(IssueType::Subtask),
            "bug" => Some(IssueType::Bug),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("To Do", Status::Open)]
    #[case("todo", Status::Open)]
    #[case("In-Progress", Status::InProgress)]
    #[case("in_progress", Status::InProgress)]
    #[case("Code Review", Status::InReview)]
    #[case("Resolved", Status::Done)]
    #[case("closed", Status::Done)]
    #[case("Won't Do", Status::Cancelled)]
    #[case("Backlog", Status::Planned)]
    fn test_status_parse_aliases(#[case] input: &str, #[case] expected: Status) {
        assert_eq!(Status::parse(input), Some(expected));
    }

    #[test]
    fn test_status_parse_unknown() {
        assert_eq!(Status::parse("blocked-by-legal"), None);
    }

    #[test]
    fn test_status_tracker_name_round_trips() {
        for status in [
            Status::Planned,
            Status::Open,
            Status::InProgress,
            Status::InReview,
            Status::Done,
            Status::Cancelled,
        ] {
            assert_eq!(Status::parse(status.tracker_name()), Some(status));
        }
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("Blocker"), Some(Priority::Critical));
        assert_eq!(Priority::parse("minor"), Some(Priority::Low));
        assert_eq!(Priority::parse("?"), None);
    }

    #[test]
    fn test_issue_type_parse() {
        assert_eq!(IssueType::parse("Sub-task"), Some(IssueType::Subtask));
        assert_eq!(IssueType::parse("User Story"), Some(IssueType::Story));
    }
}
