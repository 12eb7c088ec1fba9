//! The sync engine: matching, change detection, backups, conflicts,
//! commands and the orchestrators that drive them.

pub mod audit;
pub mod backup;
pub mod commands;
pub mod conflict;
pub mod diff;
pub mod incremental;
pub mod matching;
pub mod multi_epic;
pub mod orchestrator;
pub mod parallel;
pub mod reverse;
pub mod state;

pub use audit::{AuditEntry, AuditKind, AuditTrail};
pub use backup::{
    restore_from_backup, Backup, BackupManager, BackupSummary, IssueSnapshot, RestoreOperation,
    RestoreResult,
};
pub use commands::{
    AddCommentCommand, Command, CommandKind, CommandResult, CreateSubtaskCommand,
    FailedOperation, TransitionStatusCommand, UpdateDescriptionCommand, UpdateSubtaskCommand,
};
pub use conflict::{
    create_snapshot_from_sync, Conflict, ConflictDetector, ConflictReport, ConflictResolution,
    ConflictResolver, ConflictType, FieldSnapshot, Resolution, ResolutionStrategy,
    SnapshotStore, StorySnapshot, SyncDirection, SyncField, SyncSnapshot,
};
pub use diff::{compare_backup_to_current, DiffCalculator, DiffResult, FieldDiff, IssueDiff};
pub use incremental::{
    compute_story_hash, stories_differ, ChangeDetectionResult, ChangeTracker,
    IncrementalSyncStats, StoryFingerprint,
};
pub use matching::{match_stories, match_subtasks, MatchMethod, MatchOutcome, MatchedPair};
pub use multi_epic::{EpicSyncResult, MultiEpicSyncOrchestrator, MultiEpicSyncResult};
pub use orchestrator::{AnalysisResult, CancellationToken, SyncOrchestrator, SyncResult};
pub use parallel::{
    execute_batch, execute_batches, execute_sequential, BatchContext, BatchOutcome,
    ExecutedCommand, ParallelSyncResult, PlannedCommand, StoryBatch,
};
pub use reverse::{ChangeDetail, PullChanges, PullResult, ReverseSyncOrchestrator};
pub use state::{OperationRecord, OperationStatus, StateStore, SyncPhase, SyncState};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use tempfile::NamedTempFile;

/// Serialize `value` as pretty JSON and move it into place with a rename,
/// so readers never observe a half-written document.
///
/// Each write goes through its own uniquely named temp file in the target
/// directory; concurrent writers of one path never share a temp file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("Failed to write temporary file: {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(())
}

/// Read a JSON document, returning `None` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(Some(value))
}

/// Hex-encoded SHA-256 of `data`.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Make an epic key safe to use as a file or directory name.
///
/// ASCII letters, digits, `-` and `_` pass through; every other byte is
/// percent-encoded, `%` included, so distinct keys never share a file.
pub(crate) fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.trim().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}
