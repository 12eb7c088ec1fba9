use serde::{Deserialize, Serialize};
use std::fmt;

/// Returns true when `value` has the `PREFIX-NUMBER` shape (letters, a hyphen, digits).
fn is_prefix_number(value: &str) -> bool {
    match value.split_once('-') {
        Some((prefix, number)) => {
            !prefix.is_empty()
                && !number.is_empty()
                && prefix.chars().all(|c| c.is_ascii_alphabetic())
                && number.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Identifier of a story inside the markdown document.
///
/// Format is `PREFIX-NUMBER` (`US-001`, `EU-042`, `PROJ-123`). Values are
/// trimmed and normalised to uppercase so `us-001` and `US-001` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoryId(String);

impl StoryId {
    /// Parse a story ID, normalising case and whitespace.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let normalized = value.trim().to_uppercase();
        if !is_prefix_number(&normalized) {
            anyhow::bail!("Invalid story ID format: {value}");
        }
        Ok(Self(normalized))
    }

    /// Extract a story ID from the start of a tracker summary such as
    /// `"US-001: Story Alpha"` or `"[US-001] Story Alpha"`.
    pub fn from_summary_prefix(summary: &str) -> Option<Self> {
        let token: String = summary
            .trim()
            .trim_start_matches('[')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        Self::parse(&token).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix portion (`US` for `US-001`).
    pub fn prefix(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    /// The numeric portion (`1` for `US-001`).
    pub fn number(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(_, n)| n.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StoryId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StoryId> for String {
    fn from(value: StoryId) -> Self {
        value.0
    }
}

/// Tracker issue key such as `PROJ-123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueKey(String);

impl IssueKey {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let normalized = value.trim().to_uppercase();
        if !is_prefix_number(&normalized) {
            anyhow::bail!("Invalid issue key format: {value}");
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Project portion of the key.
    pub fn project(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    pub fn number(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(_, n)| n.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IssueKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IssueKey> for String {
    fn from(value: IssueKey) -> Self {
        value.0
    }
}

/// User story description in "As a / I want / So that" form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    pub role: String,
    pub want: String,
    pub benefit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub additional_context: String,
}

impl Description {
    pub fn new(role: &str, want: &str, benefit: &str) -> Self {
        Self {
            role: role.to_string(),
            want: want.to_string(),
            benefit: benefit.to_string(),
            additional_context: String::new(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "**As a** {}\n**I want** {}\n**So that** {}",
            self.role, self.want, self.benefit
        );
        if !self.additional_context.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.additional_context);
        }
        out
    }

    pub fn to_plain_text(&self) -> String {
        format!(
            "As a {}, I want {}, so that {}",
            self.role, self.want, self.benefit
        )
    }
}

/// Either a structured role/want/benefit triple or free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoryDescription {
    Structured(Description),
    Text(String),
}

impl StoryDescription {
    pub fn to_markdown(&self) -> String {
        match self {
            StoryDescription::Structured(d) => d.to_markdown(),
            StoryDescription::Text(t) => t.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StoryDescription::Structured(_) => false,
            StoryDescription::Text(t) => t.trim().is_empty(),
        }
    }
}

/// Checkable acceptance criteria attached to a story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriteria {
    pub items: Vec<(String, bool)>,
}

impl AcceptanceCriteria {
    pub fn from_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: items.into_iter().map(|s| (s.into(), false)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fraction of checked items; an empty list counts as complete.
    pub fn completion_ratio(&self) -> f64 {
        if self.items.is_empty() {
            return 1.0;
        }
        let done = self.items.iter().filter(|(_, checked)| *checked).count();
        done as f64 / self.items.len() as f64
    }

    pub fn to_markdown(&self) -> String {
        self.items
            .iter()
            .map(|(item, checked)| {
                let checkbox = if *checked { "[x]" } else { "[ ]" };
                format!("- {checkbox} {item}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_story_id_normalizes_case() {
        let id = StoryId::parse("  us-001 ").unwrap();
        assert_eq!(id.as_str(), "US-001");
        assert_eq!(id, StoryId::parse("US-001").unwrap());
        assert_eq!(id.prefix(), "US");
        assert_eq!(id.number(), 1);
    }

    #[test]
    fn test_story_id_rejects_bad_format() {
        assert!(StoryId::parse("US001").is_err());
        assert!(StoryId::parse("-001").is_err());
        assert!(StoryId::parse("US-").is_err());
        assert!(StoryId::parse("US-12a").is_err());
    }

    #[test]
    fn test_story_id_from_summary_prefix() {
        assert_eq!(
            StoryId::from_summary_prefix("US-002: Story Beta").unwrap().as_str(),
            "US-002"
        );
        assert_eq!(
            StoryId::from_summary_prefix("[eu-7] Export").unwrap().as_str(),
            "EU-7"
        );
        assert!(StoryId::from_summary_prefix("Story Alpha").is_none());
    }

    #[test]
    fn test_issue_key_parts() {
        let key = IssueKey::parse("proj-123").unwrap();
        assert_eq!(key.to_string(), "PROJ-123");
        assert_eq!(key.project(), "PROJ");
        assert_eq!(key.number(), 123);
        assert!(IssueKey::parse("not a key").is_err());
    }

    #[test]
    fn test_story_id_serde_validates() {
        let id: StoryId = serde_json::from_str(r#""us-9""#).unwrap();
        assert_eq!(id.as_str(), "US-9");
        assert!(serde_json::from_str::<StoryId>(r#""nope""#).is_err());
    }

    #[test]
    fn test_description_markdown() {
        let d = Description::new("user", "to export", "I can share");
        assert_eq!(
            d.to_markdown(),
            "**As a** user\n**I want** to export\n**So that** I can share"
        );
        assert_eq!(
            d.to_plain_text(),
            "As a user, I want to export, so that I can share"
        );
    }

    #[test]
    fn test_acceptance_criteria_ratio() {
        let mut ac = AcceptanceCriteria::from_items(["a", "b"]);
        assert_eq!(ac.completion_ratio(), 0.0);
        ac.items[0].1 = true;
        assert_eq!(ac.completion_ratio(), 0.5);
        assert_eq!(ac.to_markdown(), "- [x] a\n- [ ] b");
        assert_eq!(AcceptanceCriteria::default().completion_ratio(), 1.0);
    }
}
