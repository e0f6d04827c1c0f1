//! User configuration, read from `<config_dir>/tavern/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::store::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, StoreConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TavernConfig {
    pub chat: ChatConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Messages requested per page
    pub page_size: usize,
    /// Keep fetching pages on load until the chat is complete
    pub auto_fetch: bool,
}

impl ChatConfig {
    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_LIMIT)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_LIMIT,
            auto_fetch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is unset
    pub level: String,
    /// Write logs to a file in this directory instead of stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        Error::Configuration("Could not determine config directory".to_string())
    })?;
    Ok(config_dir.join("tavern").join("config.toml"))
}

/// Load the configuration from the default location, or defaults if missing.
pub fn load_config() -> Result<TavernConfig> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<TavernConfig> {
    if !path.exists() {
        return Ok(TavernConfig::default());
    }
    let contents = std::fs::read_to_string(path)?;
    from_toml_str(&contents)
        .map_err(|e| Error::Configuration(format!("Invalid config at {}: {e}", path.display())))
}

pub fn from_toml_str(contents: &str) -> Result<TavernConfig> {
    toml::from_str(contents).map_err(|e| Error::Configuration(e.to_string()))
}

pub fn save_config_to(config: &TavernConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(config)
        .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;
    std::fs::write(path, contents)?;
    Ok(())
}
