//! # storysync
//!
//! A sync engine that keeps a markdown document of user stories in step with
//! an epic in an issue tracker (Jira, GitHub, GitLab, Linear, ...).
//!
//! ## Overview
//!
//! A sync run parses the document, fetches the epic's children through an
//! [`ports::IssueTrackerPort`], matches stories to issues, backs up the
//! tracker state, checks for conflicting edits since the last sync and then
//! executes a plan of commands (description updates, subtask creation and
//! updates, comments, status transitions). Every run is recorded in a
//! resumable state file, an audit trail and a queryable sync history.
//!
//! ## Key Features
//!
//! - **Dry run by default**: nothing is written until `dry_run = false`
//! - **Backups**: a full snapshot of the epic before any mutation, with rotation
//! - **Conflict detection**: three-way comparison against the last synced snapshot
//! - **Incremental sync**: unchanged stories are skipped by content fingerprint
//! - **Resume**: interrupted sessions skip operations that already completed
//! - **History**: SQLite-backed log of sessions and changes with statistics
//!
//! ## Architecture
//!
//! - Entities and identifiers ([`domain`]) and the error taxonomy ([`error`])
//! - Boundaries to trackers, parsers and formatters ([`ports`])
//! - Configuration and platform directories ([`config`]), logging ([`logger`])
//! - The sync engine and orchestrators ([`sync`])
//! - Session history ([`history`]) and rendering ([`report`])
//!
//! Concrete tracker adapters and the markdown grammar live outside this
//! crate; they plug in through the port traits.

/// Platform-agnostic configuration directory management and sync settings.
///
/// Resolves the storysync config directory following platform conventions
/// (XDG on Linux, Application Support on macOS, AppData on Windows) and
/// loads [`config::SyncConfig`] from TOML.
pub mod config;

/// Stories, subtasks, comments and the value objects that identify them.
pub mod domain;

/// Error types at the port boundary and the errors a sync can end with.
pub mod error;

/// Handlers behind the `storysync` subcommands.
pub mod handlers;

/// Sync history: one entry per session and one record per change, stored
/// in SQLite and queryable for listings, statistics and velocity.
pub mod history;

/// Logging setup (env_logger) and the persistent log file.
pub mod logger;

/// Traits the engine consumes: issue tracker, document parser, formatter
/// and writer, plus the tracker-side data they exchange.
pub mod ports;

/// Console, markdown and JSON rendering of sync results, conflict reports
/// and history.
pub mod report;

/// The sync engine.
///
/// Matching, incremental change detection, backups, conflict detection,
/// commands, session state and audit trail, and the orchestrators that run
/// them in order.
pub mod sync;

pub use error::{ConfigError, ParserError, SyncError, TrackerError};
pub use sync::{SyncOrchestrator, SyncResult};

/// Get the version of storysync
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
