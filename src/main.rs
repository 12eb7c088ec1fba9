use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use storysync::config::SyncConfig;
use storysync::handlers::{self, HistoryFilter};
use storysync::logger;
use storysync::report::ReportFormat;

#[derive(Parser)]
#[command(name = "storysync")]
#[command(about = "Inspect markdown-to-issue-tracker sync history, backups and sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./.storysync.toml, then the user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format: console, markdown or json
    #[arg(short, long, global = true, default_value = "console")]
    format: ReportFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Default)]
struct FilterArgs {
    /// Only sessions for this epic
    #[arg(long)]
    epic: Option<String>,

    /// Only sessions against this tracker type
    #[arg(long)]
    tracker: Option<String>,

    /// Only sessions with this outcome (success, partial, failed, dry_run, cancelled)
    #[arg(long)]
    outcome: Option<String>,

    /// Only sessions started in the last N days
    #[arg(long)]
    days: Option<i64>,

    /// Include dry runs
    #[arg(long)]
    dry_runs: bool,
}

impl From<FilterArgs> for HistoryFilter {
    fn from(args: FilterArgs) -> Self {
        HistoryFilter {
            epic: args.epic,
            tracker: args.tracker,
            outcome: args.outcome,
            days: args.days,
            include_dry_runs: args.dry_runs,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List recorded sync sessions
    History {
        #[command(flatten)]
        filter: FilterArgs,

        /// Maximum number of sessions to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Show one session and its changes instead of a listing
        #[arg(long)]
        show: Option<String>,

        /// Delete sessions completed more than N days ago
        #[arg(long, conflicts_with = "show")]
        prune: Option<i64>,
    },

    /// Aggregate statistics over recorded sessions
    Stats {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Sync activity per time bucket
    Velocity {
        /// How far back to look, in days
        #[arg(long, default_value_t = 28)]
        days: i64,

        /// Bucket size in days
        #[arg(long, default_value_t = 7)]
        interval: i64,
    },

    /// Inspect and rotate tracker backups
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// List sync sessions (resumable ones included)
    Sessions {
        /// Only sessions for this epic
        #[arg(long)]
        epic: Option<String>,

        /// Maximum number of sessions to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Remove completed sessions older than N days
        #[arg(long)]
        cleanup: Option<i64>,
    },

    /// Show or create the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// List backups, newest first
    List {
        #[arg(long)]
        epic: Option<String>,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the issues captured in a backup
    Show {
        backup_id: String,

        #[arg(long)]
        epic: Option<String>,
    },
    /// Apply the rotation policy now
    Cleanup {
        #[arg(long)]
        epic: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Where to write (default: the user config file)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = logger::init_logger() {
        eprintln!("Warning: Failed to initialize logger: {e}");
    }
    if let Err(e) = logger::rotate_log_if_needed() {
        log::debug!("Log rotation skipped: {e:#}");
    }

    let format = cli.format;
    match cli.command {
        Commands::History {
            filter,
            limit,
            show,
            prune,
        } => match (show, prune) {
            (Some(entry_id), _) => handlers::handle_history_show(&entry_id, format)?,
            (None, Some(days)) => handlers::handle_history_prune(days)?,
            (None, None) => handlers::handle_history_list(&filter.into(), limit, format)?,
        },
        Commands::Stats { filter } => handlers::handle_stats(&filter.into(), format)?,
        Commands::Velocity { days, interval } => {
            handlers::handle_velocity(days, interval, format)?
        }
        Commands::Backups { action } => {
            let config = SyncConfig::load(cli.config.as_deref())?;
            match action {
                BackupAction::List { epic, limit } => {
                    handlers::handle_backups_list(&config, epic.as_deref(), limit)?
                }
                BackupAction::Show { backup_id, epic } => {
                    handlers::handle_backups_show(&config, &backup_id, epic.as_deref())?
                }
                BackupAction::Cleanup { epic } => {
                    handlers::handle_backups_cleanup(&config, epic.as_deref())?
                }
            }
        }
        Commands::Sessions {
            epic,
            limit,
            cleanup,
        } => match cleanup {
            Some(days) => handlers::handle_sessions_cleanup(days)?,
            None => handlers::handle_sessions_list(epic.as_deref(), limit)?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = SyncConfig::load(cli.config.as_deref())?;
                handlers::handle_config_show(&config)?
            }
            ConfigAction::Init { path, force } => {
                handlers::handle_config_init(path.as_deref(), force)?
            }
        },
    }

    Ok(())
}
