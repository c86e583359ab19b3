//! Well-known directories under `~/.bridge/`.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base directory: `~/.bridge/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".bridge"))
}

/// Returns the logs directory: `~/.bridge/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Returns the default messenger config path: `~/.bridge/messaging.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("messaging.json"))
}
