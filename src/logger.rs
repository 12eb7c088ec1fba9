//! Console logging and the persistent `storysync.log`.

use anyhow::{Context, Result};
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::ConfigManager;

/// Size at which `storysync.log` moves aside to `storysync.log.old`.
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Install the `env_logger` backend for the `log` macros.
///
/// The level comes from `RUST_LOG` and defaults to `info`. Lines look like
/// `14:02:11 [WARN ] message` and go to stderr so that JSON and markdown
/// reports on stdout stay clean. Calling this twice is harmless.
pub fn init_logger() -> Result<()> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    let installed = env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:5}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .try_init()
        .is_ok();

    if installed {
        log::debug!("Console logging at {level:?}");
    }
    Ok(())
}

/// Append `message` to the log file in the config directory.
pub fn log_to_file(message: &str) -> Result<()> {
    append_line(&ConfigManager::log_file_path()?, message)
}

/// Move the log file aside once it grows past 10 MiB.
pub fn rotate_log_if_needed() -> Result<()> {
    if let Some(rotated) = rotate_file(&ConfigManager::log_file_path()?, MAX_LOG_SIZE)? {
        log::info!("Log file rotated to {}", rotated.display());
    }
    Ok(())
}

fn append_line(path: &Path, message: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    writeln!(
        file,
        "[{}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        message
    )
    .with_context(|| format!("Failed to write log file: {}", path.display()))
}

/// Rename `path` to `<path>.old` when larger than `max_size`, replacing any
/// earlier `.old` file. Returns the new location when a rotation happened.
fn rotate_file(path: &Path, max_size: u64) -> Result<Option<PathBuf>> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to inspect {}", path.display()))
        }
    };
    if size <= max_size {
        return Ok(None);
    }

    let rotated = path.with_extension("log.old");
    if rotated.exists() {
        fs::remove_file(&rotated)
            .with_context(|| format!("Failed to remove {}", rotated.display()))?;
    }
    fs::rename(path, &rotated)
        .with_context(|| format!("Failed to rotate {}", path.display()))?;
    Ok(Some(rotated))
}
