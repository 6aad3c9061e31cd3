use super::{fetch_page, fetch_updated_since, now_millis, purge_deleted_before, touch_timestamp};
use crate::database::models::{EntityAction, FileUpdate, ListQuery, NewFile, Page, VaultFile};
use crate::database::{EntityKind, SpaceRouter};
use crate::error::{EngineError, Result};
use crate::storage::{ContentKind, ContentStore};
use crate::versioning::path_hash;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

#[async_trait]
pub trait FileQueries: Send + Sync {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<VaultFile>;
    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<VaultFile>;
    async fn find_by_path_hash_any(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Option<VaultFile>>;
    async fn create(&self, uid: i64, file: NewFile) -> Result<VaultFile>;
    async fn update(&self, uid: i64, id: i64, update: FileUpdate) -> Result<VaultFile>;
    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()>;
    /// Hard delete, removing the blob folder
    async fn delete(&self, uid: i64, id: i64) -> Result<()>;
    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<VaultFile>>;
    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<VaultFile>>;
    async fn count_size_sum(&self, uid: i64, vault_id: i64) -> Result<(i64, i64)>;
    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>>;
}

#[derive(Clone)]
pub struct FileRepository {
    router: Arc<SpaceRouter>,
    store: ContentStore,
}

impl FileRepository {
    pub fn new(router: Arc<SpaceRouter>, store: ContentStore) -> Self {
        Self { router, store }
    }

    async fn pool(&self, uid: i64) -> Result<SqlitePool> {
        self.router.space(uid, EntityKind::File).await
    }
}

#[async_trait]
impl FileQueries for FileRepository {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<VaultFile> {
        let pool = self.pool(uid).await?;

        sqlx::query_as::<_, VaultFile>("SELECT * FROM file WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("file", id))
    }

    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<VaultFile> {
        let pool = self.pool(uid).await?;

        sqlx::query_as::<_, VaultFile>(
            r#"
            SELECT * FROM file
            WHERE vault_id = ? AND path_hash = ? AND action != 'delete'
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| EngineError::not_found("file", path_hash))
    }

    async fn find_by_path_hash_any(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Option<VaultFile>> {
        let pool = self.pool(uid).await?;

        let file = sqlx::query_as::<_, VaultFile>(
            r#"
            SELECT * FROM file
            WHERE vault_id = ? AND path_hash = ?
            ORDER BY (action = 'delete') ASC, id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?;

        Ok(file)
    }

    async fn create(&self, uid: i64, file: NewFile) -> Result<VaultFile> {
        let pool = self.pool(uid).await?;
        let now = Utc::now();

        let created = sqlx::query_as::<_, VaultFile>(
            r#"
            INSERT INTO file (
                vault_id, action, rename, path, path_hash, content_hash, save_path,
                size, ctime, mtime, updated_timestamp, created_at, updated_at
            )
            VALUES (?, ?, 0, ?, ?, ?, '', ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(file.vault_id)
        .bind(EntityAction::Create)
        .bind(&file.path)
        .bind(path_hash(&file.path))
        .bind(&file.content_hash)
        .bind(file.size)
        .bind(file.ctime)
        .bind(file.mtime)
        .bind(now_millis())
        .bind(now)
        .bind(now)
        .fetch_one(&pool)
        .await?;

        tracing::debug!("Created file {} for user {}", created.id, uid);
        Ok(created)
    }

    async fn update(&self, uid: i64, id: i64, update: FileUpdate) -> Result<VaultFile> {
        let pool = self.pool(uid).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE file SET updated_at = ");
        qb.push_bind(Utc::now());
        qb.push(", updated_timestamp = ").push_bind(now_millis());

        if let Some(action) = update.action {
            qb.push(", action = ").push_bind(action);
        }
        if let Some(rename) = update.rename {
            qb.push(", rename = ").push_bind(rename);
        }
        if let Some(path) = update.path {
            qb.push(", path_hash = ").push_bind(path_hash(&path));
            qb.push(", path = ").push_bind(path);
        }
        if let Some(content_hash) = update.content_hash {
            qb.push(", content_hash = ").push_bind(content_hash);
        }
        if let Some(save_path) = update.save_path {
            qb.push(", save_path = ").push_bind(save_path);
        }
        if let Some(size) = update.size {
            qb.push(", size = ").push_bind(size);
        }
        if let Some(ctime) = update.ctime {
            qb.push(", ctime = ").push_bind(ctime);
        }
        if let Some(mtime) = update.mtime {
            qb.push(", mtime = ").push_bind(mtime);
        }

        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" RETURNING *");

        qb.build_query_as::<VaultFile>()
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("file", id))
    }

    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        if touch_timestamp(&pool, "file", id, updated_timestamp).await? == 0 {
            return Err(EngineError::not_found("file", id));
        }
        Ok(())
    }

    async fn delete(&self, uid: i64, id: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query("DELETE FROM file WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("file", id));
        }

        self.store
            .remove_folder(&self.store.folder(uid, ContentKind::File, id))
            .await?;

        tracing::debug!("Hard deleted file {} for user {}", id, uid);
        Ok(())
    }

    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<VaultFile>> {
        let pool = self.pool(uid).await?;
        fetch_updated_since::<VaultFile>(&pool, "file", vault_id, since).await
    }

    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<VaultFile>> {
        let pool = self.pool(uid).await?;
        fetch_page::<VaultFile>(&pool, "file", query).await
    }

    async fn count_size_sum(&self, uid: i64, vault_id: i64) -> Result<(i64, i64)> {
        let pool = self.pool(uid).await?;

        let totals: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM file WHERE vault_id = ? AND action != 'delete'",
        )
        .bind(vault_id)
        .fetch_one(&pool)
        .await?;

        Ok(totals)
    }

    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>> {
        let pool = self.pool(uid).await?;
        let ids = purge_deleted_before(&pool, "file", cutoff).await?;

        for id in &ids {
            let folder = self.store.folder(uid, ContentKind::File, *id);
            if let Err(e) = self.store.remove_folder(&folder).await {
                tracing::warn!("Failed to remove folder of purged file {}: {}", id, e);
            }
        }
        Ok(ids)
    }
}
