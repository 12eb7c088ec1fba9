//! Running one document against several epics.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::orchestrator::{SyncOrchestrator, SyncResult};
use crate::domain::{Epic, UserStory};

/// Result of one epic within a multi-epic run.
#[derive(Debug, Clone, Serialize)]
pub struct EpicSyncResult {
    pub epic_key: String,
    /// Present when the epic's sync ran to completion (successfully or not)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncResult>,
    /// Set when the epic's sync aborted with an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_seconds: f64,
}

impl EpicSyncResult {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.result.as_ref().is_some_and(|r| r.success)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MultiEpicSyncResult {
    pub markdown_path: PathBuf,
    pub dry_run: bool,
    pub epics: Vec<EpicSyncResult>,
    /// Requested epics with no section in the document
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl MultiEpicSyncResult {
    /// True only when every epic succeeded.
    pub fn success(&self) -> bool {
        !self.epics.is_empty() && self.epics.iter().all(EpicSyncResult::success)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &EpicSyncResult> {
        self.epics.iter().filter(|e| e.success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &EpicSyncResult> {
        self.epics.iter().filter(|e| !e.success())
    }

    pub fn total_stories_matched(&self) -> usize {
        self.results().map(|r| r.stories_matched).sum()
    }

    pub fn total_changes(&self) -> usize {
        self.results().map(SyncResult::total_changes).sum()
    }

    fn results(&self) -> impl Iterator<Item = &SyncResult> {
        self.epics.iter().filter_map(|e| e.result.as_ref())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} of {} epic(s) synced, {} stories matched, {} change(s)",
            self.succeeded().count(),
            self.epics.len(),
            self.total_stories_matched(),
            self.total_changes()
        )
    }
}

/// Runs the single-epic state machine once per epic key.
pub struct MultiEpicSyncOrchestrator<'a> {
    inner: SyncOrchestrator<'a>,
}

impl<'a> MultiEpicSyncOrchestrator<'a> {
    pub fn new(inner: SyncOrchestrator<'a>) -> Self {
        Self { inner }
    }

    /// Sync every epic listed in the configuration.
    pub fn sync_configured(&self, markdown_path: &Path) -> MultiEpicSyncResult {
        let epics = self.inner.config().epics.clone();
        self.sync_all(markdown_path, &epics)
    }

    /// Sync `epic_keys` in order. A failing epic never stops the next one.
    ///
    /// The document is parsed once into epic sections and each epic only
    /// sees the stories of its own section. Epics without a section are
    /// skipped. An un-keyed section (a single-epic document) is used only
    /// when exactly one epic is requested.
    pub fn sync_all(&self, markdown_path: &Path, epic_keys: &[String]) -> MultiEpicSyncResult {
        let mut result = MultiEpicSyncResult {
            markdown_path: markdown_path.to_path_buf(),
            dry_run: self.inner.config().dry_run,
            epics: Vec::with_capacity(epic_keys.len()),
            skipped: Vec::new(),
        };
        if epic_keys.is_empty() {
            log::warn!("No epics configured for {}", markdown_path.display());
            return result;
        }

        let sections = match self.inner.parser().parse_epics(markdown_path) {
            Ok(sections) => sections,
            Err(e) => {
                log::error!("Could not parse {}: {e}", markdown_path.display());
                result.epics = epic_keys
                    .iter()
                    .map(|key| EpicSyncResult {
                        epic_key: key.clone(),
                        result: None,
                        error: Some(e.to_string()),
                        duration_seconds: 0.0,
                    })
                    .collect();
                return result;
            }
        };

        let cancel = self.inner.cancellation_token();
        for (idx, epic_key) in epic_keys.iter().enumerate() {
            if cancel.is_cancelled() {
                log::warn!(
                    "Cancelled; {} epic(s) not synced",
                    epic_keys.len() - idx
                );
                break;
            }

            let Some(stories) = stories_for(&sections, epic_key, epic_keys.len()) else {
                log::warn!(
                    "{} has no section for epic {}; skipping it",
                    markdown_path.display(),
                    epic_key
                );
                result.skipped.push(epic_key.clone());
                continue;
            };

            log::info!("Epic {}/{}: {}", idx + 1, epic_keys.len(), epic_key);
            let started = Instant::now();
            let outcome = self.inner.sync_stories(markdown_path, epic_key, stories);
            let duration_seconds = started.elapsed().as_secs_f64();

            result.epics.push(match outcome {
                Ok(sync) => EpicSyncResult {
                    epic_key: epic_key.clone(),
                    result: Some(sync),
                    error: None,
                    duration_seconds,
                },
                Err(e) => {
                    log::error!("Epic {epic_key} failed: {e}");
                    EpicSyncResult {
                        epic_key: epic_key.clone(),
                        result: None,
                        error: Some(e.to_string()),
                        duration_seconds,
                    }
                }
            });
        }

        log::info!("{}", result.summary());
        result
    }
}

/// Stories of the section keyed `epic_key`, falling back to an un-keyed
/// section only for single-epic runs.
fn stories_for(sections: &[Epic], epic_key: &str, requested: usize) -> Option<Vec<UserStory>> {
    let keyed = sections.iter().find(|epic| {
        epic.key
            .as_ref()
            .is_some_and(|key| key.as_str().eq_ignore_ascii_case(epic_key))
    });
    if let Some(epic) = keyed {
        return Some(epic.stories.clone());
    }
    if requested != 1 {
        return None;
    }
    let mut unkeyed = sections.iter().filter(|epic| epic.key.is_none()).peekable();
    unkeyed.peek()?;
    Some(unkeyed.flat_map(|epic| epic.stories.iter().cloned()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IssueKey, StoryId};

    fn epic(key: &str, success: bool, error: Option<&str>) -> EpicSyncResult {
        EpicSyncResult {
            epic_key: key.to_string(),
            result: error.is_none().then(|| SyncResult {
                success,
                stories_matched: 2,
                stories_updated: 1,
                ..SyncResult::default()
            }),
            error: error.map(str::to_string),
            duration_seconds: 0.0,
        }
    }

    #[test]
    fn test_success_requires_every_epic() {
        let mut result = MultiEpicSyncResult {
            epics: vec![epic("A-1", true, None), epic("B-1", true, None)],
            ..MultiEpicSyncResult::default()
        };
        assert!(result.success());
        assert_eq!(result.total_stories_matched(), 4);
        assert_eq!(result.total_changes(), 2);

        result.epics.push(epic("C-1", false, Some("authentication failed")));
        assert!(!result.success());
        assert_eq!(result.failed().count(), 1);
        assert_eq!(result.summary(), "2 of 3 epic(s) synced, 4 stories matched, 2 change(s)");
    }

    #[test]
    fn test_partial_epic_is_not_success() {
        let result = MultiEpicSyncResult {
            epics: vec![epic("A-1", false, None)],
            ..MultiEpicSyncResult::default()
        };
        assert!(!result.success());
    }

    #[test]
    fn test_empty_run_is_not_success() {
        assert!(!MultiEpicSyncResult::default().success());
    }

    fn section(key: Option<&str>, ids: &[&str]) -> Epic {
        let stories = ids
            .iter()
            .map(|id| UserStory::new(StoryId::parse(id).unwrap(), id))
            .collect();
        Epic::new(key.map(|k| IssueKey::parse(k).unwrap()), "", stories)
    }

    fn ids(stories: Option<Vec<UserStory>>) -> Option<Vec<String>> {
        stories.map(|s| s.iter().map(|story| story.id.to_string()).collect())
    }

    fn owned(ids: &[&str]) -> Option<Vec<String>> {
        Some(ids.iter().map(|id| id.to_string()).collect())
    }

    #[test]
    fn test_stories_for_picks_matching_section() {
        let sections = vec![
            section(Some("PROJ-1"), &["US-001"]),
            section(Some("PROJ-2"), &["US-002", "US-003"]),
        ];

        assert_eq!(
            ids(stories_for(&sections, "proj-2", 2)),
            owned(&["US-002", "US-003"])
        );
        assert_eq!(ids(stories_for(&sections, "PROJ-1", 2)), owned(&["US-001"]));
        assert_eq!(ids(stories_for(&sections, "PROJ-9", 2)), None);
    }

    #[test]
    fn test_unkeyed_section_only_for_single_epic_runs() {
        let sections = vec![section(None, &["US-001"])];

        assert_eq!(ids(stories_for(&sections, "PROJ-1", 1)), owned(&["US-001"]));
        assert_eq!(ids(stories_for(&sections, "PROJ-1", 2)), None);
        assert_eq!(ids(stories_for(&[], "PROJ-1", 1)), None);
    }
}
