//! Configuration command handlers

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use std::path::Path;

use crate::config::{ConfigManager, SyncConfig};

/// Handle config show command
pub fn handle_config_show(config: &SyncConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", "Current Configuration".cyan().bold());
    println!("{}", "=".repeat(80).cyan());
    println!("{rendered}");

    match config.validate() {
        Ok(()) => println!("{}", "Configuration is valid.".green()),
        Err(e) => println!("{} {}", "Invalid:".red().bold(), e),
    }
    Ok(())
}

/// Handle config init command: write the defaults to `path` or the user
/// config file
pub fn handle_config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let target = match path {
        Some(p) => p.to_path_buf(),
        None => {
            ConfigManager::ensure_config_dir()?;
            ConfigManager::config_file_path()?
        }
    };
    if target.exists() && !force {
        return Err(anyhow!(
            "{} already exists; pass --force to overwrite",
            target.display()
        ));
    }

    SyncConfig::default().save_to(&target)?;
    println!(
        "{} {}",
        "Configuration written to:".green().bold(),
        target.display().to_string().cyan()
    );
    println!(
        "{}",
        "dry_run is on; set dry_run = false once the plan looks right.".dimmed()
    );
    Ok(())
}
