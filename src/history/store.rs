use anyhow::Result;
use chrono::{DateTime, Utc};

use super::types::{
    days_before, ChangeRecord, HistoryQuery, StoreInfo, SyncHistoryEntry, SyncOutcome,
    SyncStatistics, VelocityMetrics,
};

/// Durable, queryable record of sync sessions and the changes they made.
///
/// Entries are append-only. The only mutation after recording is marking
/// changes as rolled back.
pub trait SyncHistoryStore: Send + Sync {
    /// Append a session entry. Recording an existing `entry_id` is an error.
    fn record(&self, entry: &SyncHistoryEntry) -> Result<()>;

    fn record_change(&self, change: &ChangeRecord) -> Result<()> {
        self.record_changes(std::slice::from_ref(change))
    }

    /// Append several changes in one transaction.
    fn record_changes(&self, changes: &[ChangeRecord]) -> Result<()>;

    fn get_entry(&self, entry_id: &str) -> Result<Option<SyncHistoryEntry>>;

    /// Changes of one session in the order they happened.
    fn get_changes(&self, entry_id: &str) -> Result<Vec<ChangeRecord>>;

    fn query(&self, query: &HistoryQuery) -> Result<Vec<SyncHistoryEntry>>;

    fn count(&self, query: Option<&HistoryQuery>) -> Result<usize>;

    /// Most recently started session, optionally for one epic.
    fn get_latest(&self, epic_key: Option<&str>) -> Result<Option<SyncHistoryEntry>> {
        let query = HistoryQuery {
            epic_key: epic_key.map(str::to_string),
            limit: Some(1),
            ..HistoryQuery::default()
        };
        Ok(self.query(&query)?.into_iter().next())
    }

    fn get_last_successful(&self, epic_key: Option<&str>) -> Result<Option<SyncHistoryEntry>> {
        let query = HistoryQuery {
            epic_key: epic_key.map(str::to_string),
            outcomes: vec![SyncOutcome::Success],
            limit: Some(1),
            ..HistoryQuery::default()
        };
        Ok(self.query(&query)?.into_iter().next())
    }

    /// Changes of a session not yet rolled back.
    fn get_rollbackable_changes(&self, entry_id: &str) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .get_changes(entry_id)?
            .into_iter()
            .filter(|c| !c.rolled_back)
            .collect())
    }

    /// Flag changes of `entry_id` as undone by `rollback_entry_id`.
    ///
    /// With `change_ids` only those changes are flagged. Returns how many
    /// changes were newly flagged.
    fn mark_rolled_back(
        &self,
        entry_id: &str,
        rollback_entry_id: &str,
        change_ids: Option<&[String]>,
    ) -> Result<usize>;

    fn get_statistics(&self, query: Option<&HistoryQuery>) -> Result<SyncStatistics>;

    /// Activity per `interval_days` bucket between `start` and `end`.
    fn get_velocity(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_days: i64,
    ) -> Result<Vec<VelocityMetrics>>;

    /// Sessions started in the last `days` days, newest first.
    fn get_recent_activity(&self, days: i64, limit: usize) -> Result<Vec<SyncHistoryEntry>> {
        let query = HistoryQuery {
            after: Some(days_before(Utc::now(), days)?),
            limit: Some(limit),
            ..HistoryQuery::default()
        };
        self.query(&query)
    }

    /// Delete sessions completed before `cutoff`, with their changes.
    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn info(&self) -> Result<StoreInfo>;

    fn vacuum(&self) -> Result<()>;
}
