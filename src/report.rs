use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::history::{SyncHistoryEntry, SyncOutcome, SyncStatistics, VelocityMetrics};
use crate::sync::{ConflictReport, ConflictType, MultiEpicSyncResult, PullResult, SyncResult};

/// Output format for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Console,
    Markdown,
    Json,
}

impl FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "console" | "text" => Ok(ReportFormat::Console),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            "json" => Ok(ReportFormat::Json),
            _ => Err(anyhow!("Unsupported format: {s}")),
        }
    }
}

/// Something that can be shown on the console or written as markdown/JSON.
pub trait Report: Serialize {
    fn to_markdown(&self) -> String;

    /// Print a colored console summary
    fn print_summary(&self);

    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize report to JSON")
    }

    /// Render in `format`; console output goes straight to stdout.
    fn render(&self, format: ReportFormat) -> Result<()> {
        match format {
            ReportFormat::Json => println!("{}", self.to_json()?),
            ReportFormat::Markdown => println!("{}", self.to_markdown()),
            ReportFormat::Console => self.print_summary(),
        }
        Ok(())
    }

    /// Save report to file
    fn save(&self, path: &Path, format: ReportFormat) -> Result<()> {
        let content = match format {
            ReportFormat::Json => self.to_json()?,
            ReportFormat::Markdown => self.to_markdown(),
            ReportFormat::Console => {
                return Err(anyhow!("Console reports cannot be saved; use markdown or json"))
            }
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;

        println!(
            "{} {}",
            "Report saved to:".green().bold(),
            path.display().to_string().cyan()
        );
        Ok(())
    }
}

fn colored_outcome(outcome: SyncOutcome) -> colored::ColoredString {
    match outcome {
        SyncOutcome::Success => outcome.as_str().green(),
        SyncOutcome::Partial => outcome.as_str().yellow(),
        SyncOutcome::Failed => outcome.as_str().red(),
        SyncOutcome::DryRun => outcome.as_str().cyan(),
        SyncOutcome::Cancelled => outcome.as_str().dimmed(),
    }
}

fn conflict_label(conflict_type: ConflictType) -> &'static str {
    match conflict_type {
        ConflictType::TrackerModified => "tracker modified",
        ConflictType::MarkdownModified => "markdown modified",
        ConflictType::BothModified => "both modified",
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n## {title}\n");
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
}

impl Report for SyncResult {
    fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Sync Report: {}\n", self.epic_key);
        let _ = writeln!(out, "**Session:** `{}`", self.session_id);
        let status = if self.cancelled {
            "cancelled"
        } else if self.success {
            "success"
        } else {
            "failed"
        };
        let _ = writeln!(out, "**Status:** {status}");
        if self.dry_run {
            let _ = writeln!(out, "**Mode:** dry run (no changes were made)");
        }
        if let Some(backup_id) = &self.backup_id {
            let _ = writeln!(out, "**Backup:** `{backup_id}`");
        }

        out.push_str("\n| Metric | Count |\n|---|---|\n");
        for (label, count) in [
            ("Stories matched", self.stories_matched),
            ("Stories updated", self.stories_updated),
            ("Subtasks created", self.subtasks_created),
            ("Subtasks updated", self.subtasks_updated),
            ("Comments added", self.comments_added),
            ("Statuses updated", self.statuses_updated),
        ] {
            let _ = writeln!(out, "| {label} | {count} |");
        }

        if let Some(stats) = &self.incremental {
            let _ = writeln!(
                out,
                "\nIncremental: {} changed, {} unchanged of {} stories.",
                stats.changed_stories, stats.skipped_stories, stats.total_stories
            );
        }
        if let Some(report) = self.conflicts.as_ref().filter(|r| r.has_conflicts()) {
            let _ = writeln!(out, "\n{} conflict(s) detected.", report.conflict_count());
        }

        push_list(&mut out, "Errors", &self.errors);
        push_list(&mut out, "Warnings", &self.warnings);
        out
    }

    fn print_summary(&self) {
        println!("\n{}", format!("=== Sync: {} ===", self.epic_key).bold().cyan());
        if self.dry_run {
            println!("{}", "DRY RUN: no changes were made".yellow());
        }
        println!("{}: {}", "Session".bold(), self.session_id);
        if let Some(backup_id) = &self.backup_id {
            println!("{}: {}", "Backup".bold(), backup_id);
        }
        println!("{}: {}", "Stories matched".bold(), self.stories_matched);
        println!("{}: {}", "Stories updated".bold(), self.stories_updated);
        println!(
            "{}: {} created, {} updated",
            "Subtasks".bold(),
            self.subtasks_created,
            self.subtasks_updated
        );
        println!("{}: {}", "Comments added".bold(), self.comments_added);
        println!("{}: {}", "Statuses updated".bold(), self.statuses_updated);

        for warning in &self.warnings {
            println!("  {} {}", "!".yellow(), warning);
        }
        for error in &self.errors {
            println!("  {} {}", "x".red(), error);
        }

        if self.cancelled {
            println!("\n{}", "Sync cancelled".yellow().bold());
        } else if self.success {
            println!("\n{}", "Sync completed".green().bold());
        } else {
            println!(
                "\n{}",
                format!("Sync finished with {} error(s)", self.errors.len())
                    .red()
                    .bold()
            );
        }
    }
}

impl Report for ConflictReport {
    fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Conflict Report: {}\n", self.epic_key);
        let _ = writeln!(
            out,
            "**Checked:** {} stories, {} fields",
            self.stories_checked, self.fields_checked
        );
        let _ = writeln!(out, "**Total Conflicts:** {}\n", self.conflict_count());

        if !self.has_conflicts() {
            out.push_str("No conflicts detected.\n");
            return out;
        }

        out.push_str("## Conflicts\n\n");
        for (i, c) in self.conflicts.iter().enumerate() {
            let _ = writeln!(
                out,
                "### {}. {} ({}) `{}`\n",
                i + 1,
                c.story_id,
                c.issue_key,
                c.field
            );
            let _ = writeln!(out, "- **Type:** {}", conflict_label(c.conflict_type));
            let _ = writeln!(out, "- **Markdown:** {}", c.markdown_value);
            let _ = writeln!(out, "- **Tracker:** {}", c.tracker_value);
            let _ = writeln!(out, "- **Last synced:** {}\n", c.snapshot_value);
        }
        out
    }

    fn print_summary(&self) {
        println!("\n{}", "=== Conflict Report ===".bold().cyan());
        println!("{}: {}", "Epic".bold(), self.epic_key);
        println!(
            "{}: {}",
            "Total Conflicts".bold(),
            self.conflict_count().to_string().yellow()
        );

        if !self.has_conflicts() {
            println!("\n{}", "No conflicts detected!".green());
            return;
        }

        for (i, c) in self.conflicts.iter().enumerate() {
            println!(
                "\n{}. {} {} [{}]",
                (i + 1).to_string().cyan(),
                c.story_id.yellow(),
                c.field.to_string().bold(),
                conflict_label(c.conflict_type)
            );
            println!("   Markdown:    {}", c.markdown_value);
            println!("   Tracker:     {}", c.tracker_value);
            println!("   Last synced: {}", c.snapshot_value.dimmed());
        }
        println!();
    }
}

impl Report for MultiEpicSyncResult {
    fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Multi-Epic Sync Report\n");
        let _ = writeln!(out, "{}\n", self.summary());
        out.push_str("| Epic | Status | Matched | Changes |\n|---|---|---|---|\n");
        for epic in &self.epics {
            let (matched, changes) = epic
                .result
                .as_ref()
                .map_or((0, 0), |r| (r.stories_matched, r.total_changes()));
            let status = match &epic.error {
                Some(e) => format!("error: {e}"),
                None if epic.success() => "success".to_string(),
                None => "failed".to_string(),
            };
            let _ = writeln!(out, "| {} | {} | {} | {} |", epic.epic_key, status, matched, changes);
        }
        out
    }

    fn print_summary(&self) {
        println!("\n{}", "=== Multi-Epic Sync ===".bold().cyan());
        for epic in &self.epics {
            let mark = if epic.success() { "ok".green() } else { "failed".red() };
            println!("  {} {}", epic.epic_key.bold(), mark);
            if let Some(error) = &epic.error {
                println!("    {}", error.red());
            }
        }
        println!("\n{}", self.summary());
    }
}

impl Report for PullResult {
    fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Pull Report: {}\n", self.epic_key);
        let _ = writeln!(out, "{}\n", self.summary());
        for (story, changes) in self.changes.by_story() {
            let _ = writeln!(out, "## {story}\n");
            for change in changes {
                let _ = writeln!(out, "- {}", change.describe());
            }
            out.push('\n');
        }
        push_list(&mut out, "Errors", &self.errors);
        push_list(&mut out, "Warnings", &self.warnings);
        out
    }

    fn print_summary(&self) {
        println!("\n{}", format!("=== Pull: {} ===", self.epic_key).bold().cyan());
        if self.dry_run {
            println!("{}", "DRY RUN: document not modified".yellow());
        }
        for change in &self.changes.changes {
            println!("  {} {}", "~".cyan(), change.describe());
        }
        for error in &self.errors {
            println!("  {} {}", "x".red(), error);
        }
        println!("\n{}", self.summary());
    }
}

/// A listing of history entries.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct HistoryListing<'a>(pub &'a [SyncHistoryEntry]);

impl Report for HistoryListing<'_> {
    fn to_markdown(&self) -> String {
        let mut out = String::from("# Sync History\n\n");
        if self.0.is_empty() {
            out.push_str("No sync history recorded.\n");
            return out;
        }
        out.push_str("| Started | Epic | Tracker | Outcome | Ops (ok/failed) | Duration |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for e in self.0 {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {}/{} | {:.1}s |",
                e.started_at.format("%Y-%m-%d %H:%M"),
                e.epic_key,
                e.tracker_type,
                e.outcome,
                e.operations_succeeded,
                e.operations_failed,
                e.duration_seconds
            );
        }
        out
    }

    fn print_summary(&self) {
        if self.0.is_empty() {
            println!("{}", "No sync history recorded.".yellow());
            return;
        }
        println!("\n{}", "=== Sync History ===".bold().cyan());
        for e in self.0 {
            println!(
                "{}  {}  {:<12} {:<8} {} ok, {} failed  ({:.1}s){}",
                e.started_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
                e.entry_id.cyan(),
                e.epic_key.bold(),
                colored_outcome(e.outcome),
                e.operations_succeeded,
                e.operations_failed,
                e.duration_seconds,
                if e.dry_run { " [dry run]" } else { "" }
            );
            if let Some(error) = &e.error_message {
                println!("    {}", error.red());
            }
        }
    }
}

impl Report for SyncStatistics {
    fn to_markdown(&self) -> String {
        let mut out = String::from("# Sync Statistics\n\n");
        let _ = writeln!(out, "- **Total syncs:** {}", self.total_syncs);
        let _ = writeln!(out, "- **Successful:** {}", self.successful_syncs);
        let _ = writeln!(out, "- **Partial:** {}", self.partial_syncs);
        let _ = writeln!(out, "- **Failed:** {}", self.failed_syncs);
        let _ = writeln!(out, "- **Dry runs:** {}", self.dry_run_syncs);
        let _ = writeln!(out, "- **Success rate:** {:.1}%", self.success_rate());
        let _ = writeln!(out, "- **Operations:** {}", self.total_operations);
        let _ = writeln!(out, "- **Average duration:** {:.1}s", self.average_duration_seconds);

        if !self.syncs_by_tracker.is_empty() {
            out.push_str("\n## By tracker\n\n");
            for (tracker, count) in &self.syncs_by_tracker {
                let _ = writeln!(out, "- {tracker}: {count}");
            }
        }
        if !self.syncs_by_epic.is_empty() {
            out.push_str("\n## By epic\n\n");
            for (epic, count) in &self.syncs_by_epic {
                let _ = writeln!(out, "- {epic}: {count}");
            }
        }
        out
    }

    fn print_summary(&self) {
        println!("\n{}", "=== Sync Statistics ===".bold().cyan());
        println!("{}: {}", "Total syncs".bold(), self.total_syncs);
        println!(
            "{}: {} success, {} partial, {} failed, {} dry run, {} cancelled",
            "Outcomes".bold(),
            self.successful_syncs.to_string().green(),
            self.partial_syncs.to_string().yellow(),
            self.failed_syncs.to_string().red(),
            self.dry_run_syncs,
            self.cancelled_syncs
        );
        println!(
            "{}: {:.1}%",
            "Success rate".bold(),
            self.success_rate()
        );
        println!("{}: {}", "Operations".bold(), self.total_operations);
        println!(
            "{}: {:.1}s",
            "Average duration".bold(),
            self.average_duration_seconds
        );
        if let (Some(first), Some(last)) = (self.first_sync, self.last_sync) {
            println!(
                "{}: {} .. {}",
                "Range".bold(),
                first.format("%Y-%m-%d"),
                last.format("%Y-%m-%d")
            );
        }
        for (tracker, count) in &self.syncs_by_tracker {
            println!("  {:<12} {}", tracker.cyan(), count);
        }
    }
}

/// Velocity buckets, oldest first.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct VelocityReport<'a>(pub &'a [VelocityMetrics]);

impl Report for VelocityReport<'_> {
    fn to_markdown(&self) -> String {
        let mut out = String::from("# Sync Velocity\n\n");
        out.push_str("| Period | Syncs | Successful | Operations | Avg duration |\n");
        out.push_str("|---|---|---|---|---|\n");
        for m in self.0 {
            let _ = writeln!(
                out,
                "| {} .. {} | {} | {} | {}/{} | {:.1}s |",
                m.period_start.format("%Y-%m-%d"),
                m.period_end.format("%Y-%m-%d"),
                m.total_syncs,
                m.successful_syncs,
                m.operations_succeeded,
                m.operations_total,
                m.average_duration_seconds
            );
        }
        out
    }

    fn print_summary(&self) {
        println!("\n{}", "=== Sync Velocity ===".bold().cyan());
        for m in self.0 {
            let bar = "#".repeat(m.total_syncs.min(50));
            println!(
                "{}  {:>4} syncs  {:>5} ops  {}",
                m.period_start.format("%Y-%m-%d").to_string().dimmed(),
                m.total_syncs,
                m.operations_total,
                bar.green()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Conflict, SyncDirection, SyncField};

    fn result() -> SyncResult {
        SyncResult {
            success: false,
            epic_key: "PROJ-100".to_string(),
            session_id: "sync-abc".to_string(),
            stories_matched: 2,
            stories_updated: 1,
            errors: vec!["Update description of PROJ-2: not found".to_string()],
            ..SyncResult::default()
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("md".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert!("xml".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn test_sync_result_markdown() {
        let md = result().to_markdown();
        assert!(md.contains("# Sync Report: PROJ-100"));
        assert!(md.contains("**Status:** failed"));
        assert!(md.contains("| Stories updated | 1 |"));
        assert!(md.contains("## Errors"));
        assert!(!md.contains("## Warnings"));
    }

    #[test]
    fn test_sync_result_json_keeps_stable_fields() {
        let json: serde_json::Value = serde_json::from_str(&result().to_json().unwrap()).unwrap();
        for key in [
            "success",
            "dry_run",
            "stories_matched",
            "stories_updated",
            "subtasks_created",
            "subtasks_updated",
            "comments_added",
            "statuses_updated",
            "warnings",
            "errors",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_conflict_report_markdown() {
        let mut report = ConflictReport::new("PROJ-100", SyncDirection::Push);
        assert!(report.to_markdown().contains("No conflicts detected"));

        report.conflicts.push(Conflict {
            story_id: "US-001".to_string(),
            issue_key: "PROJ-1".to_string(),
            field: SyncField::Title,
            markdown_value: "A".to_string(),
            tracker_value: "B".to_string(),
            snapshot_value: "A".to_string(),
            conflict_type: ConflictType::TrackerModified,
            tracker_updated_at: None,
        });
        let md = report.to_markdown();
        assert!(md.contains("### 1. US-001 (PROJ-1) `title`"));
        assert!(md.contains("- **Type:** tracker modified"));
    }

    #[test]
    fn test_empty_history_listing() {
        let md = HistoryListing(&[]).to_markdown();
        assert!(md.contains("No sync history recorded"));
        assert_eq!(HistoryListing(&[]).to_json().unwrap(), "[]");
    }

    #[test]
    fn test_save_rejects_console() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.txt");
        assert!(result().save(&path, ReportFormat::Console).is_err());
        result().save(&path, ReportFormat::Markdown).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("PROJ-100"));
    }
}
