//! Configuration for courseware-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::consistency::Consistency;
use crate::db::RetryConfig;
use crate::error::StorageError;
use crate::migration::MigrationPhase;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("courseware-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the ledger database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Tenant keyspace every statement is scoped to
    #[serde(default = "default_keyspace")]
    pub keyspace: String,

    /// Consistency level stamped on every read and write
    #[serde(default)]
    pub consistency: Consistency,

    /// Maximum pooled SQLite connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Which back-reference tables are written and read
    #[serde(default)]
    pub edge_migration: MigrationPhase,

    /// Buffered events per subscriber before it lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Retry policy for idempotent statements
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_database_file() -> String {
    "ledger.db".to_string()
}

fn default_keyspace() -> String {
    "learner".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            keyspace: default_keyspace(),
            consistency: Consistency::default(),
            pool_size: default_pool_size(),
            edge_migration: MigrationPhase::default(),
            event_capacity: default_event_capacity(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content = toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.keyspace.trim().is_empty() {
            return Err(StorageError::Config("keyspace must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(StorageError::Config("pool_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(StorageError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Get ledger database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            keyspace = "cohort_a"
            consistency = "local_quorum"
            edge_migration = "unified_only"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.keyspace, "cohort_a");
        assert_eq!(config.consistency, Consistency::LocalQuorum);
        assert_eq!(config.edge_migration, MigrationPhase::UnifiedOnly);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert_eq!(config.pool_size, 8);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.database_path(), dir.path().join("ledger.db"));
        assert_eq!(loaded.consistency, Consistency::Quorum);
        assert_eq!(loaded.edge_migration, MigrationPhase::DualWrite);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = Config {
            pool_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }
}
