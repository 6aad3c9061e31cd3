//! Engine configuration
//!
//! Central location for configuration constants, resource limits and the
//! injected `EngineConfig` that every component receives at construction.

use crate::error::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ===== Content Store Layout =====

/// Note body file inside a note or history folder
pub const CONTENT_FILE: &str = "content.txt";
/// Last snapshotted note body (diff base for the next history entry)
pub const SNAPSHOT_FILE: &str = "snapshot.txt";
/// Serialized diff patch inside a history folder
pub const DIFF_FILE: &str = "diff.patch";
/// Fixed blob filename inside a file folder
pub const BLOB_FILE: &str = "file.dat";

// ===== Full-Text Index =====

/// Schema version of the note FTS table.
/// Bumping this drops and rebuilds every user's index on next open.
pub const NOTE_FTS_VERSION: &str = "2";

/// Upper bound on search results per page
pub const MAX_SEARCH_PAGE_SIZE: u32 = 200;

// ===== Write Queue =====

/// Default per-user queue depth
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 100;
/// Default time a caller waits for its write to complete
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 30_000;
/// Idle lanes are retired after this long without work
pub const DEFAULT_QUEUE_IDLE_TIMEOUT_SECS: u64 = 600;

// ===== Listing =====

/// Default page size for paged listings
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Maximum page size for paged listings
pub const MAX_PAGE_SIZE: u32 = 1_000;

/// Behavior when a user's write queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Fail fast with a retryable error
    Reject,
    /// Wait for a free slot (bounded by the write timeout)
    Block,
}

/// Runtime configuration, deserialized from JSON with every field defaulted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global registry database. Per-user databases derive their names from it.
    pub database_path: PathBuf,
    /// Root of the Content Store (`<vault_root>/u_<uid>/...`)
    pub vault_root: PathBuf,
    pub pool_max_connections: u32,
    pub busy_timeout_secs: u64,

    pub write_queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub write_timeout_ms: u64,
    pub queue_idle_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,

    /// Debounce before an edit is snapshotted into history. Zero snapshots inline.
    pub history_delay_secs: u64,
    pub history_keep_versions: u32,
    /// History older than this (and outside the keep floor) is pruned. Zero disables pruning.
    pub history_retention_days: u32,
    /// Soft-deleted entities older than this are purged. Zero disables purging.
    pub soft_delete_retention_days: u32,

    pub snapshot_sweep_cron: String,
    pub history_prune_cron: String,
    pub purge_cron: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("storage/database/db.sqlite3"),
            vault_root: PathBuf::from("storage/vault"),
            pool_max_connections: 5,
            busy_timeout_secs: 5,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            queue_full_policy: QueueFullPolicy::Reject,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            queue_idle_timeout_secs: DEFAULT_QUEUE_IDLE_TIMEOUT_SECS,
            shutdown_timeout_secs: 10,
            history_delay_secs: 10,
            history_keep_versions: 100,
            history_retention_days: 30,
            soft_delete_retention_days: 30,
            snapshot_sweep_cron: "0 * * * * *".to_string(),
            history_prune_cron: "0 30 3 * * *".to_string(),
            purge_cron: "0 0 4 * * *".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        if !path.exists() {
            tracing::info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Convenience for tests and embedders: everything under one directory.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            database_path: dir.join("database").join("db.sqlite3"),
            vault_root: dir.join("vault"),
            ..Self::default()
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn queue_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_idle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn history_delay(&self) -> Duration {
        Duration::from_secs(self.history_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"history_keep_versions": 3, "queue_full_policy": "block"}"#)
                .unwrap();

        assert_eq!(config.history_keep_versions, 3);
        assert_eq!(config.queue_full_policy, QueueFullPolicy::Block);
        assert_eq!(config.write_queue_capacity, DEFAULT_WRITE_QUEUE_CAPACITY);
        assert_eq!(config.write_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::load(Some(&temp.path().join("absent.json"))).unwrap();
        assert_eq!(config.pool_max_connections, 5);
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"vault_root": "/srv/vault", "history_delay_secs": 0}"#).unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.vault_root, PathBuf::from("/srv/vault"));
        assert_eq!(config.history_delay(), Duration::ZERO);
    }
}
