//! Pairing markdown stories with tracker issues, and subtasks with
//! sub-issues.
//!
//! Unmatched issues are reported, never deleted: absence from the markdown
//! is not a deletion signal.

use serde::{Deserialize, Serialize};

use crate::domain::{StoryId, Subtask, UserStory};
use crate::ports::IssueData;

/// How a story was paired with its issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Story ID recorded on the issue
    StoryId,
    /// Story ID at the start of the issue summary
    SummaryPrefix,
    /// Case-insensitive title equality
    Title,
    /// Leftover stories and issues paired in order
    Position,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::StoryId => "story_id",
            MatchMethod::SummaryPrefix => "summary_prefix",
            MatchMethod::Title => "title",
            MatchMethod::Position => "position",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub story: UserStory,
    pub issue: IssueData,
    pub method: MatchMethod,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// Matched pairs, in markdown order
    pub matched: Vec<MatchedPair>,
    pub unmatched_stories: Vec<UserStory>,
    pub unmatched_issues: Vec<IssueData>,
    pub warnings: Vec<String>,
}

/// Issue summary with a leading story-ID token and its separator removed.
///
/// `"US-001: Story Alpha"` and `"[US-001] Story Alpha"` both become
/// `"Story Alpha"`.
pub fn strip_story_prefix(summary: &str) -> &str {
    let trimmed = summary.trim();
    if StoryId::from_summary_prefix(trimmed).is_none() {
        return trimmed;
    }

    let rest = trimmed.trim_start_matches('[');
    let token_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(rest.len());
    rest[token_len..]
        .trim_start_matches(|c: char| c == ']' || c == ':' || c == '-' || c.is_whitespace())
        .trim()
}

fn recorded_id(issue: &IssueData) -> Option<StoryId> {
    issue
        .story_id
        .as_deref()
        .and_then(|id| StoryId::parse(id).ok())
}

/// Claim the first free issue satisfying `matches` for every unassigned story.
fn assign_pass<F>(
    stories: &[UserStory],
    issues: &[IssueData],
    method: MatchMethod,
    assignment: &mut [Option<(usize, MatchMethod)>],
    claimed: &mut [bool],
    matches: F,
) where
    F: Fn(&UserStory, &IssueData) -> bool,
{
    for (s_idx, story) in stories.iter().enumerate() {
        if assignment[s_idx].is_some() {
            continue;
        }
        let found = (0..issues.len()).find(|&i_idx| !claimed[i_idx] && matches(story, &issues[i_idx]));
        if let Some(i_idx) = found {
            claimed[i_idx] = true;
            assignment[s_idx] = Some((i_idx, method));
        }
    }
}

/// Match stories to issues.
///
/// Order of precedence: recorded story ID, story ID prefix in the summary,
/// case-insensitive title, then (when `positional_fallback`) position among
/// whatever is left. Every non-ID match produces a warning.
pub fn match_stories(
    stories: &[UserStory],
    issues: &[IssueData],
    positional_fallback: bool,
) -> MatchOutcome {
    let mut assignment: Vec<Option<(usize, MatchMethod)>> = vec![None; stories.len()];
    let mut claimed = vec![false; issues.len()];
    let mut warnings = Vec::new();

    assign_pass(stories, issues, MatchMethod::StoryId, &mut assignment, &mut claimed, |story, issue| {
        recorded_id(issue).as_ref() == Some(&story.id)
    });
    assign_pass(
        stories,
        issues,
        MatchMethod::SummaryPrefix,
        &mut assignment,
        &mut claimed,
        |story, issue| StoryId::from_summary_prefix(&issue.summary).as_ref() == Some(&story.id),
    );
    assign_pass(stories, issues, MatchMethod::Title, &mut assignment, &mut claimed, |story, issue| {
        let title = story.title.trim();
        !title.is_empty() && strip_story_prefix(&issue.summary).eq_ignore_ascii_case(title)
    });

    if positional_fallback {
        let mut leftovers = (0..issues.len()).filter(|i| !claimed[*i]);
        for slot in assignment.iter_mut().filter(|a| a.is_none()) {
            match leftovers.next() {
                Some(i_idx) => *slot = Some((i_idx, MatchMethod::Position)),
                None => break,
            }
        }
        for slot in assignment.iter().flatten() {
            claimed[slot.0] = true;
        }
    }

    let mut outcome = MatchOutcome::default();
    for (story, slot) in stories.iter().zip(&assignment) {
        match slot {
            Some((i_idx, method)) => {
                let issue = &issues[*i_idx];
                match method {
                    MatchMethod::StoryId => {}
                    MatchMethod::SummaryPrefix => warnings.push(format!(
                        "{} matched {} by summary prefix; no story ID is recorded on the issue",
                        story.id, issue.key
                    )),
                    MatchMethod::Title => warnings.push(format!(
                        "{} matched {} by title '{}'",
                        story.id, issue.key, story.title
                    )),
                    MatchMethod::Position => warnings.push(format!(
                        "{} matched {} by position; verify the pairing",
                        story.id, issue.key
                    )),
                }
                outcome.matched.push(MatchedPair {
                    story: story.clone(),
                    issue: issue.clone(),
                    method: *method,
                });
            }
            None => {
                warnings.push(format!(
                    "{} ('{}') has no matching tracker issue",
                    story.id, story.title
                ));
                outcome.unmatched_stories.push(story.clone());
            }
        }
    }

    for (issue, taken) in issues.iter().zip(&claimed) {
        if !taken {
            log::info!(
                "Tracker issue {} is not referenced by the markdown",
                issue.key
            );
            outcome.unmatched_issues.push(issue.clone());
        }
    }

    outcome.warnings = warnings;
    outcome
}

/// Pair each markdown subtask with an existing sub-issue.
///
/// Matches by case-insensitive name first, then by position among the
/// sub-issues no name claimed. The result has one entry per subtask, in
/// markdown order; `None` means the subtask must be created.
pub fn match_subtasks<'a>(
    subtasks: &[Subtask],
    existing: &'a [IssueData],
) -> Vec<(usize, Option<&'a IssueData>)> {
    let mut claimed = vec![false; existing.len()];
    let mut slots: Vec<Option<usize>> = vec![None; subtasks.len()];

    for (s_idx, subtask) in subtasks.iter().enumerate() {
        let name = subtask.name.trim();
        let found = (0..existing.len()).find(|&i_idx| {
            !claimed[i_idx] && strip_story_prefix(&existing[i_idx].summary).eq_ignore_ascii_case(name)
        });
        if let Some(i_idx) = found {
            claimed[i_idx] = true;
            slots[s_idx] = Some(i_idx);
        }
    }

    let mut leftovers = (0..existing.len()).filter(|i| !claimed[*i]).collect::<Vec<_>>();
    leftovers.reverse();
    for slot in slots.iter_mut().filter(|s| s.is_none()) {
        match leftovers.pop() {
            Some(i_idx) => *slot = Some(i_idx),
            None => break,
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(s_idx, slot)| (s_idx, slot.map(|i| &existing[i])))
        .collect()
}
