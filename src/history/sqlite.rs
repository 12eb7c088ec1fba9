use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::store::SyncHistoryStore;
use super::types::{
    day_span, ChangeRecord, HistoryQuery, StoreInfo, SyncHistoryEntry, SyncOutcome,
    SyncStatistics, VelocityMetrics,
};

const ENTRY_COLUMNS: &str = "entry_id, session_id, markdown_path, epic_key, tracker_type, \
     outcome, started_at_ms, completed_at_ms, duration_seconds, operations_total, \
     operations_succeeded, operations_failed, operations_skipped, dry_run, user, \
     config_snapshot, error_message, metadata";

const CHANGE_COLUMNS: &str = "change_id, entry_id, operation_type, entity_type, entity_id, \
     story_id, field_name, old_value, new_value, timestamp_ms, rolled_back, rollback_entry_id";

/// History store backed by a single SQLite file.
///
/// Every call opens its own connection and keeps its transaction short, so
/// the store can be shared across threads and processes.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    db_path: PathBuf,
}

impl SqliteHistoryStore {
    /// Open (and create if needed) the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create history directory {}", parent.display())
                })?;
            }
        }
        let store = Self { db_path };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open history database {}", self.db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS sync_history (
              entry_id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              markdown_path TEXT NOT NULL,
              epic_key TEXT NOT NULL,
              tracker_type TEXT NOT NULL,
              outcome TEXT NOT NULL,
              started_at_ms INTEGER NOT NULL,
              completed_at_ms INTEGER NOT NULL,
              duration_seconds REAL NOT NULL,
              operations_total INTEGER NOT NULL,
              operations_succeeded INTEGER NOT NULL,
              operations_failed INTEGER NOT NULL,
              operations_skipped INTEGER NOT NULL,
              dry_run INTEGER NOT NULL,
              user TEXT,
              config_snapshot TEXT NOT NULL,
              error_message TEXT,
              metadata TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_epic ON sync_history(epic_key);
            CREATE INDEX IF NOT EXISTS idx_history_started ON sync_history(started_at_ms);

            CREATE TABLE IF NOT EXISTS sync_changes (
              change_id TEXT PRIMARY KEY,
              entry_id TEXT NOT NULL,
              operation_type TEXT NOT NULL,
              entity_type TEXT NOT NULL,
              entity_id TEXT NOT NULL,
              story_id TEXT,
              field_name TEXT,
              old_value TEXT,
              new_value TEXT,
              timestamp_ms INTEGER NOT NULL,
              rolled_back INTEGER NOT NULL DEFAULT 0,
              rollback_entry_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_changes_entry ON sync_changes(entry_id);
            "#,
        )
        .context("Failed to initialize history schema")?;
        Ok(())
    }

    /// Flush the write-ahead log into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        self.connect()?
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<SyncHistoryEntry> {
    let outcome: String = row.get(5)?;
    let outcome = SyncOutcome::parse(&outcome).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Text,
            format!("unknown sync outcome '{outcome}'").into(),
        )
    })?;
    let config: String = row.get(15)?;
    let metadata: String = row.get(17)?;

    Ok(SyncHistoryEntry {
        entry_id: row.get(0)?,
        session_id: row.get(1)?,
        markdown_path: row.get(2)?,
        epic_key: row.get(3)?,
        tracker_type: row.get(4)?,
        outcome,
        started_at: from_ms(row.get(6)?),
        completed_at: from_ms(row.get(7)?),
        duration_seconds: row.get(8)?,
        operations_total: row.get::<_, i64>(9)? as usize,
        operations_succeeded: row.get::<_, i64>(10)? as usize,
        operations_failed: row.get::<_, i64>(11)? as usize,
        operations_skipped: row.get::<_, i64>(12)? as usize,
        dry_run: row.get(13)?,
        user: row.get(14)?,
        config_snapshot: serde_json::from_str(&config).unwrap_or_default(),
        error_message: row.get(16)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        change_id: row.get(0)?,
        entry_id: row.get(1)?,
        operation_type: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        story_id: row.get(5)?,
        field_name: row.get(6)?,
        old_value: row.get(7)?,
        new_value: row.get(8)?,
        timestamp: from_ms(row.get(9)?),
        rolled_back: row.get(10)?,
        rollback_entry_id: row.get(11)?,
    })
}

/// `WHERE ...` clause (possibly empty) and its positional parameters.
fn where_clause(query: &HistoryQuery) -> (String, Vec<SqlValue>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(epic) = &query.epic_key {
        conditions.push("epic_key = ?".to_string());
        values.push(SqlValue::Text(epic.clone()));
    }
    if let Some(tracker) = &query.tracker_type {
        conditions.push("tracker_type = ?".to_string());
        values.push(SqlValue::Text(tracker.clone()));
    }
    if !query.outcomes.is_empty() {
        let marks = vec!["?"; query.outcomes.len()].join(", ");
        conditions.push(format!("outcome IN ({marks})"));
        values.extend(
            query
                .outcomes
                .iter()
                .map(|o| SqlValue::Text(o.as_str().to_string())),
        );
    }
    if let Some(dry_run) = query.dry_run {
        conditions.push("dry_run = ?".to_string());
        values.push(SqlValue::Integer(i64::from(dry_run)));
    }
    if let Some(after) = query.after {
        conditions.push("started_at_ms >= ?".to_string());
        values.push(SqlValue::Integer(to_ms(after)));
    }
    if let Some(before) = query.before {
        conditions.push("started_at_ms < ?".to_string());
        values.push(SqlValue::Integer(to_ms(before)));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

impl SyncHistoryStore for SqliteHistoryStore {
    fn record(&self, entry: &SyncHistoryEntry) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO sync_history ({ENTRY_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            params![
                entry.entry_id,
                entry.session_id,
                entry.markdown_path,
                entry.epic_key,
                entry.tracker_type,
                entry.outcome.as_str(),
                to_ms(entry.started_at),
                to_ms(entry.completed_at),
                entry.duration_seconds,
                entry.operations_total as i64,
                entry.operations_succeeded as i64,
                entry.operations_failed as i64,
                entry.operations_skipped as i64,
                entry.dry_run,
                entry.user,
                serde_json::to_string(&entry.config_snapshot)?,
                entry.error_message,
                serde_json::to_string(&entry.metadata)?,
            ],
        )
        .with_context(|| format!("Failed to record history entry {}", entry.entry_id))?;
        tx.commit()?;
        log::debug!("Recorded sync history entry {}", entry.entry_id);
        Ok(())
    }

    fn record_changes(&self, changes: &[ChangeRecord]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for change in changes {
            tx.execute(
                &format!(
                    "INSERT INTO sync_changes ({CHANGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    change.change_id,
                    change.entry_id,
                    change.operation_type,
                    change.entity_type,
                    change.entity_id,
                    change.story_id,
                    change.field_name,
                    change.old_value,
                    change.new_value,
                    to_ms(change.timestamp),
                    change.rolled_back,
                    change.rollback_entry_id,
                ],
            )
            .with_context(|| format!("Failed to record change {}", change.change_id))?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_entry(&self, entry_id: &str) -> Result<Option<SyncHistoryEntry>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM sync_history WHERE entry_id = ?1"),
                params![entry_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn get_changes(&self, entry_id: &str) -> Result<Vec<ChangeRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM sync_changes WHERE entry_id = ?1 \
             ORDER BY timestamp_ms ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![entry_id], change_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query(&self, query: &HistoryQuery) -> Result<Vec<SyncHistoryEntry>> {
        let (filter, mut values) = where_clause(query);
        let order = if query.order_desc { "DESC" } else { "ASC" };
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_history{filter} ORDER BY started_at_ms {order}"
        );
        if query.limit.is_some() || query.offset > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(SqlValue::Integer(query.limit.map_or(-1, |l| l as i64)));
            values.push(SqlValue::Integer(query.offset as i64));
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), entry_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count(&self, query: Option<&HistoryQuery>) -> Result<usize> {
        let (filter, values) = query.map(where_clause).unwrap_or_default();
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sync_history{filter}"),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn mark_rolled_back(
        &self,
        entry_id: &str,
        rollback_entry_id: &str,
        change_ids: Option<&[String]>,
    ) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let updated = match change_ids {
            None => tx.execute(
                "UPDATE sync_changes SET rolled_back = 1, rollback_entry_id = ?1 \
                 WHERE entry_id = ?2 AND rolled_back = 0",
                params![rollback_entry_id, entry_id],
            )?,
            Some(ids) => {
                let mut total = 0;
                for id in ids {
                    total += tx.execute(
                        "UPDATE sync_changes SET rolled_back = 1, rollback_entry_id = ?1 \
                         WHERE entry_id = ?2 AND change_id = ?3 AND rolled_back = 0",
                        params![rollback_entry_id, entry_id, id],
                    )?;
                }
                total
            }
        };
        tx.commit()?;
        log::info!("Marked {updated} change(s) of {entry_id} as rolled back by {rollback_entry_id}");
        Ok(updated)
    }

    fn get_statistics(&self, query: Option<&HistoryQuery>) -> Result<SyncStatistics> {
        let mut query = query.cloned().unwrap_or_default();
        query.limit = None;
        query.offset = 0;
        query.order_desc = false;

        let mut stats = SyncStatistics::default();
        for entry in self.query(&query)? {
            stats.total_syncs += 1;
            match entry.outcome {
                SyncOutcome::Success => stats.successful_syncs += 1,
                SyncOutcome::Failed => stats.failed_syncs += 1,
                SyncOutcome::Partial => stats.partial_syncs += 1,
                SyncOutcome::DryRun => stats.dry_run_syncs += 1,
                SyncOutcome::Cancelled => stats.cancelled_syncs += 1,
            }
            stats.total_operations += entry.operations_total;
            stats.total_duration_seconds += entry.duration_seconds;
            *stats.syncs_by_tracker.entry(entry.tracker_type).or_insert(0) += 1;
            *stats.syncs_by_epic.entry(entry.epic_key).or_insert(0) += 1;
            if stats.first_sync.map_or(true, |first| entry.started_at < first) {
                stats.first_sync = Some(entry.started_at);
            }
            if stats.last_sync.map_or(true, |last| entry.started_at > last) {
                stats.last_sync = Some(entry.started_at);
            }
        }
        if stats.total_syncs > 0 {
            stats.average_duration_seconds =
                stats.total_duration_seconds / stats.total_syncs as f64;
        }
        Ok(stats)
    }

    fn get_velocity(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_days: i64,
    ) -> Result<Vec<VelocityMetrics>> {
        if interval_days <= 0 {
            bail!("Velocity interval must be at least one day, got {interval_days}");
        }
        if end <= start {
            return Ok(Vec::new());
        }

        let entries = self.query(&HistoryQuery {
            after: Some(start),
            order_desc: false,
            ..HistoryQuery::default()
        })?;
        let interval = day_span(interval_days)?;

        let mut buckets = Vec::new();
        let mut bucket_start = start;
        while bucket_start < end {
            let bucket_end = bucket_start
                .checked_add_signed(interval)
                .map_or(end, |next| next.min(end));
            let last = bucket_end == end;
            let in_bucket: Vec<&SyncHistoryEntry> = entries
                .iter()
                .filter(|e| {
                    e.started_at >= bucket_start
                        && (e.started_at < bucket_end || (last && e.started_at == bucket_end))
                })
                .collect();

            let duration: f64 = in_bucket.iter().map(|e| e.duration_seconds).sum();
            buckets.push(VelocityMetrics {
                period_start: bucket_start,
                period_end: bucket_end,
                total_syncs: in_bucket.len(),
                successful_syncs: in_bucket
                    .iter()
                    .filter(|e| e.outcome == SyncOutcome::Success)
                    .count(),
                operations_total: in_bucket.iter().map(|e| e.operations_total).sum(),
                operations_succeeded: in_bucket.iter().map(|e| e.operations_succeeded).sum(),
                average_duration_seconds: if in_bucket.is_empty() {
                    0.0
                } else {
                    duration / in_bucket.len() as f64
                },
            });
            bucket_start = bucket_end;
        }
        Ok(buckets)
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM sync_changes WHERE entry_id IN \
             (SELECT entry_id FROM sync_history WHERE completed_at_ms < ?1)",
            params![to_ms(cutoff)],
        )?;
        let deleted = tx.execute(
            "DELETE FROM sync_history WHERE completed_at_ms < ?1",
            params![to_ms(cutoff)],
        )?;
        tx.commit()?;
        if deleted > 0 {
            log::info!("Deleted {deleted} history entr(ies) completed before {cutoff}");
        }
        Ok(deleted)
    }

    fn info(&self) -> Result<StoreInfo> {
        let conn = self.connect()?;
        let entry_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sync_history", [], |row| row.get(0))?;
        let change_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sync_changes", [], |row| row.get(0))?;
        let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(started_at_ms), MAX(started_at_ms) FROM sync_history",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(StoreInfo {
            backend: "sqlite".to_string(),
            location: self.db_path.display().to_string(),
            entry_count: entry_count as usize,
            change_count: change_count as usize,
            storage_size_bytes: fs::metadata(&self.db_path).ok().map(|m| m.len()),
            oldest_entry: oldest.map(from_ms),
            newest_entry: newest.map(from_ms),
        })
    }

    fn vacuum(&self) -> Result<()> {
        self.connect()?.execute_batch("VACUUM;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteHistoryStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    fn entry(
        session: &str,
        epic: &str,
        tracker: &str,
        outcome: SyncOutcome,
        started_ago: ChronoDuration,
        completed_ago: ChronoDuration,
        ops: usize,
    ) -> SyncHistoryEntry {
        let now = Utc::now();
        let mut e = SyncHistoryEntry::new(session, "/docs/stories.md", epic, tracker, outcome);
        e.started_at = now - started_ago;
        e.completed_at = now - completed_ago;
        e.duration_seconds = (started_ago - completed_ago).num_seconds() as f64;
        e.operations_total = ops;
        e.operations_succeeded = ops;
        e.dry_run = outcome == SyncOutcome::DryRun;
        e
    }

    fn sample_entries() -> Vec<SyncHistoryEntry> {
        let h = ChronoDuration::hours;
        let m = ChronoDuration::minutes;
        vec![
            entry("session-0", "PROJ-100", "jira", SyncOutcome::Success, h(5), h(4), 20),
            entry("session-1", "PROJ-100", "github", SyncOutcome::Failed, h(3), h(2), 15),
            entry("session-2", "PROJ-200", "jira", SyncOutcome::Success, h(2), h(1), 25),
            entry("session-3", "PROJ-300", "linear", SyncOutcome::DryRun, h(1), m(30), 10),
            entry("session-4", "PROJ-100", "jira", SyncOutcome::Partial, m(30), m(0), 30),
        ]
    }

    fn seeded() -> (TempDir, SqliteHistoryStore) {
        let (dir, store) = store();
        for e in sample_entries() {
            store.record(&e).unwrap();
        }
        (dir, store)
    }

    fn sample_changes(entry_id: &str) -> Vec<ChangeRecord> {
        vec![
            ChangeRecord::new(entry_id, "create", "subtask", "TEST-20").for_story("US-001"),
            ChangeRecord::new(entry_id, "update", "story", "TEST-10")
                .for_story("US-001")
                .with_field(
                    "description",
                    Some("Old description".to_string()),
                    Some("New description".to_string()),
                ),
            ChangeRecord::new(entry_id, "transition", "story", "TEST-10")
                .with_field("status", Some("To Do".to_string()), Some("Done".to_string())),
        ]
    }

    #[test]
    fn test_record_and_get_entry() {
        let (_dir, store) = store();
        let mut e = SyncHistoryEntry::new("sync-1", "stories.md", "PROJ-1", "jira", SyncOutcome::Success);
        e.operations_total = 10;
        e.operations_succeeded = 9;
        e.operations_failed = 1;
        e.user = Some("dev".to_string());
        e.config_snapshot = json!({"dry_run": false, "sync_subtasks": true});
        e.metadata.insert("source".to_string(), "cli".to_string());
        store.record(&e).unwrap();

        let loaded = store.get_entry(&e.entry_id).unwrap().unwrap();
        assert_eq!(loaded.session_id, "sync-1");
        assert_eq!(loaded.outcome, SyncOutcome::Success);
        assert_eq!(loaded.operations_failed, 1);
        assert_eq!(loaded.user.as_deref(), Some("dev"));
        assert_eq!(loaded.config_snapshot, e.config_snapshot);
        assert_eq!(loaded.metadata, e.metadata);
        assert_eq!(loaded.started_at.timestamp_millis(), e.started_at.timestamp_millis());

        assert!(store.get_entry("hist-missing").unwrap().is_none());
    }

    #[test]
    fn test_entries_are_append_only() {
        let (_dir, store) = store();
        let e = SyncHistoryEntry::new("sync-1", "stories.md", "PROJ-1", "jira", SyncOutcome::Success);
        store.record(&e).unwrap();
        assert!(store.record(&e).is_err());
    }

    #[test]
    fn test_record_and_read_changes() {
        let (_dir, store) = store();
        let e = SyncHistoryEntry::new("sync-1", "stories.md", "PROJ-1", "jira", SyncOutcome::Success);
        store.record(&e).unwrap();
        store.record_changes(&sample_changes(&e.entry_id)).unwrap();
        store
            .record_change(&ChangeRecord::new(&e.entry_id, "comment", "story", "TEST-11"))
            .unwrap();

        let changes = store.get_changes(&e.entry_id).unwrap();
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].operation_type, "create");
        assert_eq!(changes[1].old_value.as_deref(), Some("Old description"));
        assert_eq!(changes[1].new_value.as_deref(), Some("New description"));
        assert_eq!(changes[3].operation_type, "comment");
    }

    #[test]
    fn test_query_filters() {
        let (_dir, store) = seeded();

        assert_eq!(store.query(&HistoryQuery::default()).unwrap().len(), 5);
        assert_eq!(store.query(&HistoryQuery::for_epic("PROJ-100")).unwrap().len(), 3);

        let jira = HistoryQuery {
            tracker_type: Some("jira".to_string()),
            ..HistoryQuery::default()
        };
        assert_eq!(store.query(&jira).unwrap().len(), 3);

        let success = HistoryQuery {
            outcomes: vec![SyncOutcome::Success],
            ..HistoryQuery::default()
        };
        assert_eq!(store.query(&success).unwrap().len(), 2);

        let dry = HistoryQuery {
            dry_run: Some(true),
            ..HistoryQuery::default()
        };
        let dry_results = store.query(&dry).unwrap();
        assert_eq!(dry_results.len(), 1);
        assert!(dry_results[0].dry_run);

        let recent = HistoryQuery {
            after: Some(Utc::now() - ChronoDuration::minutes(75)),
            ..HistoryQuery::default()
        };
        assert_eq!(store.query(&recent).unwrap().len(), 2);
    }

    #[test]
    fn test_query_ordering_and_pagination() {
        let (_dir, store) = seeded();

        let newest = store.query(&HistoryQuery::default()).unwrap();
        assert_eq!(newest[0].session_id, "session-4");

        let oldest_first = HistoryQuery {
            order_desc: false,
            ..HistoryQuery::default()
        };
        assert_eq!(store.query(&oldest_first).unwrap()[0].session_id, "session-0");

        let page = HistoryQuery {
            limit: Some(2),
            offset: 2,
            ..HistoryQuery::default()
        };
        let results = store.query(&page).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].session_id, "session-2");
    }

    #[test]
    fn test_count() {
        let (_dir, store) = seeded();
        assert_eq!(store.count(None).unwrap(), 5);
        let failed = HistoryQuery {
            outcomes: vec![SyncOutcome::Failed],
            ..HistoryQuery::default()
        };
        assert_eq!(store.count(Some(&failed)).unwrap(), 1);
    }

    #[test]
    fn test_latest_and_last_successful() {
        let (_dir, store) = seeded();
        assert_eq!(store.get_latest(None).unwrap().unwrap().session_id, "session-4");
        assert_eq!(
            store.get_latest(Some("PROJ-200")).unwrap().unwrap().session_id,
            "session-2"
        );

        let last_ok = store.get_last_successful(Some("PROJ-100")).unwrap().unwrap();
        assert_eq!(last_ok.session_id, "session-0");
        assert_eq!(last_ok.outcome, SyncOutcome::Success);
        assert!(store.get_last_successful(Some("PROJ-300")).unwrap().is_none());
    }

    #[test]
    fn test_mark_all_rolled_back() {
        let (_dir, store) = store();
        let e = SyncHistoryEntry::new("sync-1", "stories.md", "PROJ-1", "jira", SyncOutcome::Success);
        store.record(&e).unwrap();
        store.record_changes(&sample_changes(&e.entry_id)).unwrap();
        assert_eq!(store.get_rollbackable_changes(&e.entry_id).unwrap().len(), 3);

        let count = store.mark_rolled_back(&e.entry_id, "hist-rollback01", None).unwrap();
        assert_eq!(count, 3);
        for change in store.get_changes(&e.entry_id).unwrap() {
            assert!(change.rolled_back);
            assert_eq!(change.rollback_entry_id.as_deref(), Some("hist-rollback01"));
        }
        assert!(store.get_rollbackable_changes(&e.entry_id).unwrap().is_empty());
        assert_eq!(store.mark_rolled_back(&e.entry_id, "hist-rollback02", None).unwrap(), 0);
    }

    #[test]
    fn test_mark_specific_changes_rolled_back() {
        let (_dir, store) = store();
        let e = SyncHistoryEntry::new("sync-1", "stories.md", "PROJ-1", "jira", SyncOutcome::Success);
        store.record(&e).unwrap();
        let changes = sample_changes(&e.entry_id);
        store.record_changes(&changes).unwrap();

        let ids = vec![changes[0].change_id.clone(), changes[1].change_id.clone()];
        let count = store
            .mark_rolled_back(&e.entry_id, "hist-rollback01", Some(&ids))
            .unwrap();
        assert_eq!(count, 2);

        let remaining = store.get_rollbackable_changes(&e.entry_id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].change_id, changes[2].change_id);
    }

    #[test]
    fn test_statistics() {
        let (_dir, store) = seeded();
        let stats = store.get_statistics(None).unwrap();
        assert_eq!(stats.total_syncs, 5);
        assert_eq!(stats.successful_syncs, 2);
        assert_eq!(stats.failed_syncs, 1);
        assert_eq!(stats.partial_syncs, 1);
        assert_eq!(stats.dry_run_syncs, 1);
        assert_eq!(stats.total_operations, 100);
        assert!(stats.total_duration_seconds > 0.0);
        assert!(stats.average_duration_seconds > 0.0);
        assert_eq!(stats.syncs_by_tracker["jira"], 3);
        assert_eq!(stats.syncs_by_epic["PROJ-100"], 3);

        let jira = HistoryQuery {
            tracker_type: Some("jira".to_string()),
            limit: Some(1),
            ..HistoryQuery::default()
        };
        let filtered = store.get_statistics(Some(&jira)).unwrap();
        assert_eq!(filtered.total_syncs, 3);
        assert_eq!(filtered.successful_syncs, 2);
        assert_eq!(filtered.partial_syncs, 1);
    }

    #[test]
    fn test_velocity_buckets() {
        let (_dir, store) = seeded();
        let end = Utc::now();
        let start = end - ChronoDuration::days(7);

        let metrics = store.get_velocity(start, end, 1).unwrap();
        assert_eq!(metrics.len(), 7);
        assert_eq!(metrics[6].total_syncs, 5);
        assert_eq!(metrics[6].operations_total, 100);
        assert!(metrics[..6].iter().all(|m| m.total_syncs == 0));

        assert_eq!(store.get_velocity(start, end, 3).unwrap().len(), 3);
        assert!(store.get_velocity(start, end, 0).is_err());
    }

    #[test]
    fn test_velocity_with_huge_interval() {
        let (_dir, store) = seeded();
        let end = Utc::now();
        let start = end - ChronoDuration::days(7);

        assert!(store.get_velocity(start, end, i64::MAX).is_err());

        // Representable span whose end lies past chrono's last date
        let metrics = store.get_velocity(start, end, 100_000_000).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].period_end, end);
        assert_eq!(metrics[0].total_syncs, 5);
        assert!(store.get_recent_activity(i64::MAX, 10).is_err());
    }

    #[test]
    fn test_recent_activity() {
        let (_dir, store) = seeded();
        assert_eq!(store.get_recent_activity(7, 10).unwrap().len(), 5);
        assert_eq!(store.get_recent_activity(7, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_before_uses_completion_time() {
        let (_dir, store) = seeded();
        let cutoff = Utc::now() - ChronoDuration::minutes(210);
        assert_eq!(store.delete_before(cutoff).unwrap(), 1);
        assert_eq!(store.count(None).unwrap(), 4);
    }

    #[test]
    fn test_delete_removes_changes_too() {
        let (_dir, store) = store();
        let e = SyncHistoryEntry::new("sync-1", "stories.md", "PROJ-1", "jira", SyncOutcome::Success);
        store.record(&e).unwrap();
        store.record_changes(&sample_changes(&e.entry_id)).unwrap();

        store.delete_before(Utc::now() + ChronoDuration::days(1)).unwrap();
        assert!(store.get_changes(&e.entry_id).unwrap().is_empty());
        store.vacuum().unwrap();
        store.checkpoint().unwrap();
    }

    #[test]
    fn test_info() {
        let (_dir, store) = store();
        let e = SyncHistoryEntry::new("sync-1", "stories.md", "PROJ-1", "jira", SyncOutcome::Success);
        store.record(&e).unwrap();
        store.record_changes(&sample_changes(&e.entry_id)).unwrap();

        let info = store.info().unwrap();
        assert_eq!(info.backend, "sqlite");
        assert_eq!(info.entry_count, 1);
        assert_eq!(info.change_count, 3);
        assert!(info.storage_size_bytes.unwrap() > 0);
        assert!(info.oldest_entry.is_some() && info.newest_entry.is_some());
    }
}
