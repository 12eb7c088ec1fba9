use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::sync::conflict::ResolutionStrategy;

/// Name of the per-project config file looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = ".storysync.toml";

/// Cross-platform configuration directory manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the main configuration directory path following platform conventions:
    /// - Linux: $XDG_CONFIG_HOME/storysync or ~/.config/storysync
    /// - macOS: ~/Library/Application Support/storysync
    /// - Windows: %APPDATA%\storysync
    pub fn config_dir() -> Result<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
                Ok(PathBuf::from(xdg_config).join("storysync"))
            } else {
                let home = dirs::home_dir().context("Failed to get home directory")?;
                Ok(home.join(".config").join("storysync"))
            }
        }

        #[cfg(target_os = "macos")]
        {
            let home = dirs::home_dir().context("Failed to get home directory")?;
            Ok(home
                .join("Library")
                .join("Application Support")
                .join("storysync"))
        }

        #[cfg(target_os = "windows")]
        {
            Ok(dirs::config_dir()
                .context("Failed to get Windows config directory")?
                .join("storysync"))
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            let home = dirs::home_dir().context("Failed to get home directory")?;
            Ok(home.join(".storysync"))
        }
    }

    /// Get the user-level config file path (config.toml)
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the default backups directory
    pub fn backups_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("backups"))
    }

    /// Get the sync session state directory
    pub fn state_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("state"))
    }

    /// Get the conflict-detection snapshots directory
    pub fn snapshots_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("snapshots"))
    }

    /// Get the incremental-sync fingerprints directory
    pub fn fingerprints_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("fingerprints"))
    }

    /// Get the audit trail directory
    pub fn audit_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("audit"))
    }

    /// Get the sync history database path
    pub fn history_db_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("history.db"))
    }

    /// Get the log file path
    pub fn log_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("storysync.log"))
    }

    /// Ensure the configuration directory exists
    pub fn ensure_config_dir() -> Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        fs::create_dir_all(&config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;
        Ok(config_dir)
    }
}

/// How the EXECUTE phase runs per-story command batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One story after another on the calling thread.
    #[default]
    Sequential,
    /// Independent story batches on a bounded worker pool.
    Parallel {
        #[serde(default = "default_max_workers")]
        max_workers: usize,
    },
}

fn default_max_workers() -> usize {
    10
}

/// Backup settings (`[backup]` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Snapshot tracker state before mutating it
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Custom backup root; defaults to the config directory's `backups/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Maximum backups kept per epic
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Backups older than this are pruned (the newest one always survives)
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_backups: default_max_backups(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_backups() -> usize {
    10
}

fn default_retention_days() -> i64 {
    30
}

fn default_read_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

/// Configuration consumed by the sync orchestrators.
///
/// Loaded once by the caller and handed to the orchestrator by value; the
/// engine never looks configuration up on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Simulate every write (default: true, so nothing changes by accident)
    #[serde(default = "default_true")]
    pub dry_run: bool,

    #[serde(default = "default_true")]
    pub sync_descriptions: bool,

    #[serde(default = "default_true")]
    pub sync_subtasks: bool,

    #[serde(default = "default_true")]
    pub sync_comments: bool,

    #[serde(default = "default_true")]
    pub sync_statuses: bool,

    /// Skip stories whose fingerprint is unchanged since the last sync
    #[serde(default)]
    pub incremental: bool,

    /// Pair leftover stories and issues by position when nothing else matches
    #[serde(default = "default_true")]
    pub positional_fallback: bool,

    /// Resume an interrupted session for the same epic when one exists
    #[serde(default)]
    pub resume: bool,

    #[serde(default)]
    pub resolution_strategy: ResolutionStrategy,

    /// Retries for idempotent reads on rate-limit or transient errors
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Project key used when creating sub-issues; defaults to the epic's project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,

    /// Only sync stories whose ID or title contains this text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_filter: Option<String>,

    /// Epic keys for multi-epic runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub epics: Vec<String>,

    #[serde(default)]
    pub execution: ExecutionMode,

    /// Status workflow (`from -> [to, ...]`) overriding the adapter's graph
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transitions: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub backup: BackupSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            sync_descriptions: true,
            sync_subtasks: true,
            sync_comments: true,
            sync_statuses: true,
            incremental: false,
            positional_fallback: true,
            resume: false,
            resolution_strategy: ResolutionStrategy::default(),
            read_retries: default_read_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            project_key: None,
            story_filter: None,
            transitions: BTreeMap::new(),
            epics: Vec::new(),
            execution: ExecutionMode::default(),
            backup: BackupSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Locate and load configuration.
    ///
    /// Search order: `explicit` path, `./.storysync.toml`, the user config
    /// file, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let project = PathBuf::from(PROJECT_CONFIG_FILE);
        if project.exists() {
            return Self::load_from(&project);
        }

        let user = ConfigManager::config_file_path()?;
        if user.exists() {
            return Self::load_from(&user);
        }

        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: SyncConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Check the configuration before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if let ExecutionMode::Parallel { max_workers } = self.execution {
            if max_workers == 0 {
                problems.push("execution.max_workers must be at least 1".to_string());
            }
        }
        if self.backup.max_backups == 0 {
            problems.push("backup.max_backups must be at least 1".to_string());
        }
        if self.backup.retention_days <= 0 {
            problems.push("backup.retention_days must be positive".to_string());
        }
        for (idx, epic) in self.epics.iter().enumerate() {
            if epic.trim().is_empty() {
                problems.push(format!("epics[{idx}] is empty"));
            }
        }
        for (from, targets) in &self.transitions {
            if from.trim().is_empty() || targets.iter().any(|t| t.trim().is_empty()) {
                problems.push(format!("transitions entry '{from}' has an empty status"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }

    /// Backup root, falling back to the config directory.
    pub fn backup_dir(&self) -> Result<PathBuf> {
        match &self.backup.dir {
            Some(dir) => Ok(dir.clone()),
            None => ConfigManager::backups_dir(),
        }
    }

    /// Whether a story passes `story_filter`.
    pub fn includes_story(&self, story_id: &str, title: &str) -> bool {
        match &self.story_filter {
            None => true,
            Some(filter) => {
                let needle = filter.to_lowercase();
                story_id.to_lowercase().contains(&needle)
                    || title.to_lowercase().contains(&needle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_config_paths() {
        let config_dir = ConfigManager::config_dir().unwrap();
        assert!(config_dir.to_string_lossy().contains("storysync"));

        let config_file = ConfigManager::config_file_path().unwrap();
        assert!(config_file.to_string_lossy().ends_with("config.toml"));

        let history = ConfigManager::history_db_path().unwrap();
        assert!(history.to_string_lossy().ends_with("history.db"));

        let log = ConfigManager::log_file_path().unwrap();
        assert!(log.to_string_lossy().ends_with("storysync.log"));

        for dir in [
            ConfigManager::backups_dir().unwrap(),
            ConfigManager::state_dir().unwrap(),
            ConfigManager::snapshots_dir().unwrap(),
            ConfigManager::fingerprints_dir().unwrap(),
            ConfigManager::audit_dir().unwrap(),
        ] {
            assert!(dir.starts_with(&config_dir));
        }
    }

    #[test]
    #[serial]
    #[cfg(target_os = "linux")]
    fn test_xdg_config_home_respected() {
        let previous = std::env::var("XDG_CONFIG_HOME").ok();
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/test-xdg-config");
        let config_dir = ConfigManager::config_dir().unwrap();
        assert_eq!(config_dir, PathBuf::from("/tmp/test-xdg-config/storysync"));
        match previous {
            Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.dry_run);
        assert!(config.sync_descriptions && config.sync_subtasks);
        assert!(config.backup.enabled);
        assert_eq!(config.backup.max_backups, 10);
        assert_eq!(config.backup.retention_days, 30);
        assert_eq!(config.execution, ExecutionMode::Sequential);
        assert_eq!(config.resolution_strategy, ResolutionStrategy::PreferMarkdown);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            dry_run = false
            sync_comments = false
            resolution_strategy = "manual"

            [execution]
            mode = "parallel"

            [backup]
            max_backups = 3
            "#,
        )
        .unwrap();

        assert!(!config.dry_run);
        assert!(!config.sync_comments);
        assert!(config.sync_statuses);
        assert_eq!(config.resolution_strategy, ResolutionStrategy::Manual);
        assert_eq!(config.execution, ExecutionMode::Parallel { max_workers: 10 });
        assert_eq!(config.backup.max_backups, 3);
        assert_eq!(config.backup.retention_days, 30);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SyncConfig::default();
        config.epics = vec!["PROJ-1".into(), "PROJ-2".into()];
        config
            .transitions
            .insert("To Do".into(), vec!["In Progress".into()]);
        config.save_to(&path).unwrap();

        let loaded = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = SyncConfig::default();
        config.execution = ExecutionMode::Parallel { max_workers: 0 };
        config.backup.max_backups = 0;
        config.backup.retention_days = 0;
        config.epics = vec![" ".into()];

        let err = config.validate().unwrap_err();
        assert_eq!(err.problems.len(), 4);
    }

    #[test]
    fn test_story_filter() {
        let mut config = SyncConfig::default();
        assert!(config.includes_story("US-001", "Anything"));
        config.story_filter = Some("export".into());
        assert!(config.includes_story("US-002", "CSV Export"));
        assert!(!config.includes_story("US-003", "Login"));
    }
}
