//! Backup command handlers

use anyhow::{anyhow, Result};
use colored::Colorize;

use crate::config::SyncConfig;
use crate::logger;
use crate::sync::{BackupManager, IssueSnapshot};

fn manager(config: &SyncConfig) -> Result<BackupManager> {
    Ok(BackupManager::from_settings(config.backup_dir()?, &config.backup))
}

/// Handle backups list command
pub fn handle_backups_list(config: &SyncConfig, epic: Option<&str>, limit: usize) -> Result<()> {
    let backups = manager(config)?.list(epic)?;
    if backups.is_empty() {
        println!("{}", "No backups found.".yellow());
        return Ok(());
    }

    println!("{}", "Backups".cyan().bold());
    println!("{}", "=".repeat(80).cyan());
    for backup in backups.iter().take(limit) {
        println!(
            "{}  {}  {:<12} #{:<4} {} issues, {} subtasks",
            backup.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            backup.backup_id.cyan(),
            backup.epic_key.bold(),
            backup.sequence,
            backup.issue_count,
            backup.subtask_count
        );
    }
    if backups.len() > limit {
        println!(
            "\n{} Showing {} of {} backups",
            "Note:".yellow(),
            limit,
            backups.len()
        );
    }
    Ok(())
}

fn print_issue(issue: &IssueSnapshot, indent: usize) {
    let pad = " ".repeat(indent);
    let points = issue
        .story_points
        .map(|p| format!(" [{p} pts]"))
        .unwrap_or_default();
    println!(
        "{}{} {} ({}){}",
        pad,
        issue.key.bold(),
        issue.summary,
        issue.status.cyan(),
        points
    );
    for subtask in &issue.subtasks {
        print_issue(subtask, indent + 4);
    }
}

/// Handle backups show command
pub fn handle_backups_show(config: &SyncConfig, backup_id: &str, epic: Option<&str>) -> Result<()> {
    let backup = manager(config)?
        .load(backup_id, epic)?
        .ok_or_else(|| anyhow!("Backup '{backup_id}' not found"))?;

    println!("{}", format!("Backup {}", backup.backup_id).cyan().bold());
    println!("   {} {}", "Epic:".dimmed(), backup.epic_key);
    println!("   {} {}", "Document:".dimmed(), backup.markdown_path);
    println!(
        "   {} {}",
        "Created:".dimmed(),
        backup.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for (key, value) in &backup.metadata {
        println!("   {} {}", format!("{key}:").dimmed(), value);
    }
    println!();
    for issue in &backup.issues {
        print_issue(issue, 2);
    }
    Ok(())
}

/// Handle backups cleanup command
pub fn handle_backups_cleanup(config: &SyncConfig, epic: Option<&str>) -> Result<()> {
    let manager = manager(config)?;
    let removed = match epic {
        Some(epic) => manager.cleanup(epic)?,
        None => manager.cleanup_all()?,
    };
    let _ = logger::log_to_file(&format!("Removed {removed} backup(s) during cleanup"));

    if removed == 0 {
        println!("{}", "Nothing to clean up.".green());
    } else {
        println!(
            "{} Removed {} backup(s) (keeping at most {} per epic, {} days)",
            "✓".green(),
            removed,
            config.backup.max_backups,
            config.backup.retention_days
        );
    }
    Ok(())
}
