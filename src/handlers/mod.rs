//! Command handler modules
//!
//! Handlers behind the `storysync` subcommands, grouped by the store they
//! inspect. None of them talk to an issue tracker.

pub mod backups;
pub mod config;
pub mod history;
pub mod sessions;

pub use backups::{handle_backups_cleanup, handle_backups_list, handle_backups_show};
pub use config::{handle_config_init, handle_config_show};
pub use history::{
    handle_history_list, handle_history_prune, handle_history_show, handle_stats,
    handle_velocity, HistoryFilter,
};
pub use sessions::{handle_sessions_cleanup, handle_sessions_list};
