//! Sync session command handlers

use anyhow::Result;
use colored::Colorize;

use crate::config::ConfigManager;
use crate::sync::{OperationStatus, StateStore, SyncPhase};

fn store() -> Result<StateStore> {
    Ok(StateStore::new(ConfigManager::state_dir()?))
}

/// Handle sessions list command
pub fn handle_sessions_list(epic: Option<&str>, limit: usize) -> Result<()> {
    let sessions = store()?.list(epic)?;
    if sessions.is_empty() {
        println!("{}", "No sync sessions recorded.".yellow());
        return Ok(());
    }

    println!("{}", "Sync Sessions".cyan().bold());
    println!("{}", "=".repeat(80).cyan());
    for state in sessions.iter().take(limit) {
        let phase = match state.phase {
            SyncPhase::Completed => state.phase.as_str().green(),
            SyncPhase::Failed => state.phase.as_str().red(),
            SyncPhase::Cancelled => state.phase.as_str().yellow(),
            _ => format!("{} (resumable)", state.phase).magenta(),
        };
        let count = |status: OperationStatus| {
            state.operations.iter().filter(|op| op.status == status).count()
        };

        println!(
            "\n{} {} {}",
            state.session_id.bold(),
            state.epic_key.cyan(),
            phase
        );
        println!(
            "   {} {}{}",
            "Started:".dimmed(),
            state.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if state.dry_run { " [dry run]" } else { "" }
        );
        println!(
            "   {} {} completed, {} failed, {} skipped",
            "Operations:".dimmed(),
            count(OperationStatus::Completed),
            count(OperationStatus::Failed),
            count(OperationStatus::Skipped)
        );
        if let Some(backup_id) = &state.backup_id {
            println!("   {} {}", "Backup:".dimmed(), backup_id);
        }
        if let Some(error) = &state.error {
            println!("   {} {}", "Error:".dimmed(), error.red());
        }
    }
    Ok(())
}

/// Handle sessions cleanup command
pub fn handle_sessions_cleanup(older_than_days: i64) -> Result<()> {
    let removed = store()?.cleanup_completed(older_than_days)?;
    println!(
        "{} Removed {} completed session(s) older than {} days",
        "✓".green(),
        removed,
        older_than_days
    );
    Ok(())
}
