use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Final outcome of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every operation succeeded
    Success,
    /// Some operations failed, others went through
    Partial,
    /// Nothing went through, or the run aborted
    Failed,
    /// Simulated run; nothing was written
    DryRun,
    /// Stopped by the operator between stories
    Cancelled,
}

impl SyncOutcome {
    /// Returns the stored string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Success => "success",
            SyncOutcome::Partial => "partial",
            SyncOutcome::Failed => "failed",
            SyncOutcome::DryRun => "dry_run",
            SyncOutcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "success" => Some(SyncOutcome::Success),
            "partial" => Some(SyncOutcome::Partial),
            "failed" => Some(SyncOutcome::Failed),
            "dry_run" | "dryrun" => Some(SyncOutcome::DryRun),
            "cancelled" | "canceled" => Some(SyncOutcome::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `hist-` followed by 12 random hex characters.
pub fn generate_entry_id() -> String {
    format!("hist-{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// `chg-` followed by 12 random hex characters.
pub fn generate_change_id() -> String {
    format!("chg-{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// A span of `days` whole days; errors instead of panicking on values
/// chrono cannot represent.
pub fn day_span(days: i64) -> Result<TimeDelta> {
    TimeDelta::try_days(days).ok_or_else(|| anyhow!("{days} days is out of range"))
}

/// The instant `days` whole days before `anchor`.
pub fn days_before(anchor: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    anchor
        .checked_sub_signed(day_span(days)?)
        .ok_or_else(|| anyhow!("{days} days before {anchor} is out of range"))
}

/// One sync session. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub entry_id: String,
    pub session_id: String,
    pub markdown_path: String,
    pub epic_key: String,
    pub tracker_type: String,
    pub outcome: SyncOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub operations_total: usize,
    pub operations_succeeded: usize,
    pub operations_failed: usize,
    #[serde(default)]
    pub operations_skipped: usize,
    pub dry_run: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub config_snapshot: Value,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SyncHistoryEntry {
    /// Entry with zeroed counters, started and completed now.
    pub fn new(
        session_id: &str,
        markdown_path: &str,
        epic_key: &str,
        tracker_type: &str,
        outcome: SyncOutcome,
    ) -> Self {
        let now = Utc::now();
        Self {
            entry_id: generate_entry_id(),
            session_id: session_id.to_string(),
            markdown_path: markdown_path.to_string(),
            epic_key: epic_key.to_string(),
            tracker_type: tracker_type.to_string(),
            outcome,
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            operations_total: 0,
            operations_succeeded: 0,
            operations_failed: 0,
            operations_skipped: 0,
            dry_run: false,
            user: std::env::var("USER").ok(),
            config_snapshot: Value::Null,
            error_message: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// One mutation performed during a session, kept for rollback lookups.
///
/// Only `rolled_back` and `rollback_entry_id` ever change after recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: String,
    pub entry_id: String,
    /// `create`, `update`, `comment` or `transition`
    pub operation_type: String,
    /// `story` or `subtask`
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub story_id: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub rollback_entry_id: Option<String>,
}

impl ChangeRecord {
    pub fn new(entry_id: &str, operation_type: &str, entity_type: &str, entity_id: &str) -> Self {
        Self {
            change_id: generate_change_id(),
            entry_id: entry_id.to_string(),
            operation_type: operation_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            story_id: None,
            field_name: None,
            old_value: None,
            new_value: None,
            timestamp: Utc::now(),
            rolled_back: false,
            rollback_entry_id: None,
        }
    }

    pub fn for_story(mut self, story_id: &str) -> Self {
        self.story_id = Some(story_id.to_string());
        self
    }

    pub fn with_field(mut self, field: &str, old: Option<String>, new: Option<String>) -> Self {
        self.field_name = Some(field.to_string());
        self.old_value = old;
        self.new_value = new;
        self
    }
}

/// Filter for history listings. Empty fields match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub epic_key: Option<String>,
    pub tracker_type: Option<String>,
    pub outcomes: Vec<SyncOutcome>,
    pub dry_run: Option<bool>,
    /// Sessions started at or after this instant
    pub after: Option<DateTime<Utc>>,
    /// Sessions started before this instant
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub order_desc: bool,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            epic_key: None,
            tracker_type: None,
            outcomes: Vec::new(),
            dry_run: None,
            after: None,
            before: None,
            limit: None,
            offset: 0,
            order_desc: true,
        }
    }
}

impl HistoryQuery {
    pub fn for_epic(epic_key: &str) -> Self {
        Self {
            epic_key: Some(epic_key.to_string()),
            ..Self::default()
        }
    }
}

/// Aggregates over a set of sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub total_syncs: usize,
    pub successful_syncs: usize,
    pub failed_syncs: usize,
    pub partial_syncs: usize,
    pub dry_run_syncs: usize,
    pub cancelled_syncs: usize,
    pub total_operations: usize,
    pub total_duration_seconds: f64,
    pub average_duration_seconds: f64,
    pub syncs_by_tracker: BTreeMap<String, usize>,
    pub syncs_by_epic: BTreeMap<String, usize>,
    pub first_sync: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncStatistics {
    /// Successful share of non-dry-run syncs, in percent.
    pub fn success_rate(&self) -> f64 {
        let real = self.total_syncs - self.dry_run_syncs;
        if real == 0 {
            0.0
        } else {
            self.successful_syncs as f64 * 100.0 / real as f64
        }
    }
}

/// Activity within one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityMetrics {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_syncs: usize,
    pub successful_syncs: usize,
    pub operations_total: usize,
    pub operations_succeeded: usize,
    pub average_duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub backend: String,
    pub location: String,
    pub entry_count: usize,
    pub change_count: usize,
    pub storage_size_bytes: Option<u64>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}
