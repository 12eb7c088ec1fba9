//! History command handlers
//!
//! Listing, inspecting and pruning recorded sync sessions, plus the
//! statistics and velocity views.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use colored::Colorize;

use crate::config::ConfigManager;
use crate::history::{
    days_before, HistoryQuery, SqliteHistoryStore, SyncHistoryStore, SyncOutcome,
};
use crate::logger;
use crate::report::{HistoryListing, Report, ReportFormat, VelocityReport};

/// Filters shared by `history` and `stats`.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub epic: Option<String>,
    pub tracker: Option<String>,
    pub outcome: Option<String>,
    pub days: Option<i64>,
    pub include_dry_runs: bool,
}

impl HistoryFilter {
    fn to_query(&self) -> Result<HistoryQuery> {
        let outcomes = match &self.outcome {
            Some(name) => vec![SyncOutcome::parse(name)
                .ok_or_else(|| anyhow!("Unknown outcome '{name}'"))?],
            None => Vec::new(),
        };
        Ok(HistoryQuery {
            epic_key: self.epic.clone(),
            tracker_type: self.tracker.clone(),
            outcomes,
            dry_run: (!self.include_dry_runs).then_some(false),
            after: self.days.map(|d| days_before(Utc::now(), d)).transpose()?,
            ..HistoryQuery::default()
        })
    }
}

fn open_store() -> Result<SqliteHistoryStore> {
    let path = ConfigManager::history_db_path()?;
    SqliteHistoryStore::open(&path)
        .with_context(|| format!("Failed to open sync history at {}", path.display()))
}

/// Handle history list command
pub fn handle_history_list(filter: &HistoryFilter, limit: usize, format: ReportFormat) -> Result<()> {
    let store = open_store()?;
    let mut query = filter.to_query()?;
    query.limit = Some(limit);

    let entries = store.query(&query)?;
    HistoryListing(&entries).render(format)?;

    let total = store.count(Some(&filter.to_query()?))?;
    if format == ReportFormat::Console && total > entries.len() {
        println!(
            "\n{} Showing {} of {} sessions",
            "Note:".yellow(),
            entries.len(),
            total
        );
    }
    Ok(())
}

/// Handle history show command: one session and its changes
pub fn handle_history_show(entry_id: &str, format: ReportFormat) -> Result<()> {
    let store = open_store()?;
    let entry = store
        .get_entry(entry_id)?
        .ok_or_else(|| anyhow!("No history entry '{entry_id}'"))?;
    let changes = store.get_changes(entry_id)?;

    if format == ReportFormat::Json {
        let value = serde_json::json!({ "entry": entry, "changes": changes });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    HistoryListing(std::slice::from_ref(&entry)).render(format)?;
    if changes.is_empty() {
        println!("\n{}", "No changes recorded.".dimmed());
        return Ok(());
    }

    println!("\n{}", "Changes:".bold());
    for change in &changes {
        let field = change
            .field_name
            .as_deref()
            .map(|f| format!(" {f}"))
            .unwrap_or_default();
        let rolled_back = if change.rolled_back {
            " (rolled back)".yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} {} {}{}{}",
            change.operation_type.cyan(),
            change.entity_type,
            change.entity_id.bold(),
            field,
            rolled_back
        );
        if let (Some(old), Some(new)) = (&change.old_value, &change.new_value) {
            println!("      {} -> {}", old.dimmed(), new);
        }
    }
    Ok(())
}

/// Handle stats command
pub fn handle_stats(filter: &HistoryFilter, format: ReportFormat) -> Result<()> {
    let store = open_store()?;
    let query = filter.to_query()?;
    let stats = store.get_statistics(Some(&query))?;
    stats.render(format)
}

/// Handle velocity command: `days` back from now in `interval_days` buckets
pub fn handle_velocity(days: i64, interval_days: i64, format: ReportFormat) -> Result<()> {
    let store = open_store()?;
    let end = Utc::now();
    let metrics = store.get_velocity(days_before(end, days)?, end, interval_days)?;
    VelocityReport(&metrics).render(format)
}

/// Handle history prune command
pub fn handle_history_prune(older_than_days: i64) -> Result<()> {
    let store = open_store()?;
    let removed = store.delete_before(days_before(Utc::now(), older_than_days)?)?;
    store.vacuum()?;
    let _ = logger::log_to_file(&format!(
        "Pruned {removed} history session(s) older than {older_than_days} days"
    ));

    let info = store.info()?;
    println!(
        "{} Removed {} session(s); {} remain",
        "✓".green(),
        removed,
        info.entry_count
    );
    Ok(())
}
