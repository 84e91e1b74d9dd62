//! Configuration loading and data folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// TOML configuration file contents
///
/// All fields are optional; missing values fall back to environment
/// variables, database settings, or compiled defaults depending on the
/// consumer (see `qvet-engine::config` for the capability resolution order).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Data folder holding the SQLite database
    pub data_folder: Option<String>,
    /// Base URL of the capability service (classify/generate/score)
    pub capability_base_url: Option<String>,
    /// API key for the capability service
    pub capability_api_key: Option<String>,
}

/// Resolve the data folder following priority order:
/// 1. Command-line argument (highest priority)
/// 2. `QVET_DATA` environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_data_folder(cli_arg: Option<&str>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var("QVET_DATA") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Ok(config) = load_toml_config() {
        if let Some(folder) = config.data_folder {
            return PathBuf::from(folder);
        }
    }

    // Priority 4: OS-dependent compiled default
    default_data_folder()
}

/// Load the TOML config file from `QVET_CONFIG` or the platform config dir
pub fn load_toml_config() -> Result<TomlConfig> {
    let path = config_file_path()?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write the TOML config file (best-effort atomic: write then rename)
pub fn write_toml_config(config: &TomlConfig, path: &std::path::Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Get the configuration file path for the platform
pub fn config_file_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("QVET_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir()
        .map(|d| d.join("qvet").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if user_config.exists() {
        return Ok(user_config);
    }

    // System-wide fallback on Linux
    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/qvet/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config(format!(
        "Config file not found: {}",
        user_config.display()
    )))
}

/// Get OS-dependent default data folder path
fn default_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("qvet"))
        .unwrap_or_else(|| PathBuf::from("./qvet_data"))
}

/// Database file path inside the data folder
pub fn database_path(data_folder: &std::path::Path) -> PathBuf {
    data_folder.join("qvet.db")
}
