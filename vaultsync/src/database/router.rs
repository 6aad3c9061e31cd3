//! Per-user database routing
//!
//! Every user owns an isolated SQLite file whose name is derived from the
//! registry path and the uid. Handles are created lazily and cached for the
//! process lifetime. Table creation runs at most once per (uid, entity kind)
//! through a keyed once-registry.

use super::{connect_options, create_pool, schema};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Entity kinds that own tables inside a user database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Vault,
    Note,
    NoteHistory,
    NoteLink,
    Folder,
    File,
    Setting,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Vault,
        EntityKind::Note,
        EntityKind::NoteHistory,
        EntityKind::NoteLink,
        EntityKind::Folder,
        EntityKind::File,
        EntityKind::Setting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Vault => "vault",
            EntityKind::Note => "note",
            EntityKind::NoteHistory => "note_history",
            EntityKind::NoteLink => "note_link",
            EntityKind::Folder => "folder",
            EntityKind::File => "file",
            EntityKind::Setting => "setting",
        }
    }

    pub(crate) fn ddl(&self) -> &'static str {
        match self {
            EntityKind::Vault => include_str!("tables/vault.sql"),
            EntityKind::Note => include_str!("tables/note.sql"),
            EntityKind::NoteHistory => include_str!("tables/note_history.sql"),
            EntityKind::NoteLink => include_str!("tables/note_link.sql"),
            EntityKind::Folder => include_str!("tables/folder.sql"),
            EntityKind::File => include_str!("tables/file.sql"),
            EntityKind::Setting => include_str!("tables/setting.sql"),
        }
    }
}

/// Routes each uid to its own database handle
pub struct SpaceRouter {
    base_path: PathBuf,
    registry: SqlitePool,
    max_connections: u32,
    busy_timeout: Duration,
    handles: Mutex<HashMap<i64, SqlitePool>>,
    initialized: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl SpaceRouter {
    /// Open the registry database and prepare an empty handle cache.
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        let busy_timeout = Duration::from_secs(config.busy_timeout_secs);
        let registry = create_pool(
            &config.database_path,
            config.pool_max_connections,
            busy_timeout,
        )
        .await?;

        Ok(Self {
            base_path: config.database_path.clone(),
            registry,
            max_connections: config.pool_max_connections.max(1),
            busy_timeout,
            handles: Mutex::new(HashMap::new()),
            initialized: Mutex::new(HashMap::new()),
        })
    }

    /// Key shared by everything that belongs to one user database.
    pub fn db_key(uid: i64) -> String {
        format!("user_{}", uid)
    }

    /// `db.sqlite3` becomes `db_user_<uid>.sqlite3` in the same directory.
    pub fn user_db_path(&self, uid: i64) -> PathBuf {
        derive_user_path(&self.base_path, uid)
    }

    /// Cached handle for a user, created lazily without touching the disk.
    pub fn handle(&self, uid: i64) -> Result<SqlitePool> {
        validate_uid(uid)?;

        let mut handles = self
            .handles
            .lock()
            .map_err(|_| EngineError::Generic("router handle cache poisoned".to_string()))?;

        if let Some(pool) = handles.get(&uid) {
            return Ok(pool.clone());
        }

        let path = self.user_db_path(uid);
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_lazy_with(connect_options(&path, self.busy_timeout));

        tracing::info!("Opened user space {} at {:?}", uid, path);
        handles.insert(uid, pool.clone());
        Ok(pool)
    }

    /// Handle for a user with the tables of `kind` guaranteed attempted.
    ///
    /// Initialization failures are logged, not returned. They surface when the
    /// first statement against the missing table fails.
    pub async fn space(&self, uid: i64, kind: EntityKind) -> Result<SqlitePool> {
        let pool = self.handle(uid)?;
        let key = format!("{}#{}", Self::db_key(uid), kind.as_str());

        let init_pool = pool.clone();
        self.run_once(key, move || async move {
            if let Err(e) = schema::initialize_kind(&init_pool, kind).await {
                tracing::warn!(
                    "Failed to initialize {} tables for user {}: {}",
                    kind.as_str(),
                    uid,
                    e
                );
            }
        })
        .await?;

        Ok(pool)
    }

    /// Run `init` at most once per key for the process lifetime.
    ///
    /// Concurrent callers with the same key wait for the first initializer and
    /// observe its effect.
    pub async fn run_once<F, Fut>(&self, key: String, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let cell = {
            let mut initialized = self
                .initialized
                .lock()
                .map_err(|_| EngineError::Generic("router once-registry poisoned".to_string()))?;
            initialized
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_init(init).await;
        Ok(())
    }

    /// Every live user id, read from the registry rather than the filesystem.
    pub async fn all_uids(&self) -> Result<Vec<i64>> {
        let uids: Vec<i64> =
            sqlx::query_scalar("SELECT uid FROM users WHERE is_deleted = 0 ORDER BY uid")
                .fetch_all(&self.registry)
                .await?;

        Ok(uids)
    }

    /// Registry pool (users table)
    pub fn registry(&self) -> &SqlitePool {
        &self.registry
    }

    /// Close every cached handle and the registry.
    pub async fn close(&self) {
        let pools: Vec<(i64, SqlitePool)> = match self.handles.lock() {
            Ok(mut handles) => handles.drain().collect(),
            Err(_) => Vec::new(),
        };

        for (uid, pool) in pools {
            pool.close().await;
            tracing::debug!("Closed user space {}", uid);
        }

        self.registry.close().await;
        tracing::info!("Space router closed");
    }
}

fn validate_uid(uid: i64) -> Result<()> {
    if uid <= 0 {
        return Err(EngineError::InvalidInput(format!("invalid uid: {}", uid)));
    }
    Ok(())
}

fn derive_user_path(base: &Path, uid: i64) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".to_string());

    let file_name = match base.extension() {
        Some(ext) => format!("{}_{}.{}", stem, SpaceRouter::db_key(uid), ext.to_string_lossy()),
        None => format!("{}_{}", stem, SpaceRouter::db_key(uid)),
    };

    base.with_file_name(file_name)
}
