use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::message_store::{InMemoryMessageStore, MessageStore};
use super::sqlite_message_store::SqliteMessageStore;

/// Configuration for message store creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// SQLite database store
    Sqlite {
        /// Path to the database file
        path: PathBuf,
    },
    /// Process-local store, lost on exit
    Memory,
}

impl StoreConfig {
    pub fn sqlite(path: PathBuf) -> Self {
        Self::Sqlite { path }
    }

    /// `~/.tavern/messages.db`
    pub fn default_sqlite() -> Result<Self> {
        let home_dir = dirs::home_dir().ok_or_else(|| {
            Error::Configuration("Could not determine home directory".to_string())
        })?;
        Ok(Self::sqlite(home_dir.join(".tavern").join("messages.db")))
    }

    pub async fn open(&self) -> Result<Arc<dyn MessageStore>> {
        match self {
            StoreConfig::Sqlite { path } => {
                info!(target: "store_config::open", path = %path.display(), "Opening SQLite message store");
                Ok(Arc::new(SqliteMessageStore::new(path).await?))
            }
            StoreConfig::Memory => Ok(Arc::new(InMemoryMessageStore::new())),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::default_sqlite().unwrap_or_else(|_| Self::sqlite(PathBuf::from("./messages.db")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::chat_id;
    use tempfile::TempDir;

    #[test]
    fn test_default_sqlite_config() {
        let StoreConfig::Sqlite { path } = StoreConfig::default() else {
            unreachable!("expected SQLite config")
        };
        assert!(path.to_string_lossy().contains("messages.db"));
    }

    #[test]
    fn test_parses_tagged_toml() {
        let config: StoreConfig = toml::from_str("type = \"memory\"").unwrap();
        assert_eq!(config, StoreConfig::Memory);

        let config: StoreConfig =
            toml::from_str("type = \"sqlite\"\npath = \"/tmp/tavern.db\"").unwrap();
        assert_eq!(config, StoreConfig::sqlite(PathBuf::from("/tmp/tavern.db")));
    }

    #[tokio::test]
    async fn test_open_sqlite_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("messages.db");

        let store = StoreConfig::sqlite(path.clone()).open().await.unwrap();
        store.create_chat(&chat_id()).await.unwrap();
        assert!(path.exists());
    }
}
