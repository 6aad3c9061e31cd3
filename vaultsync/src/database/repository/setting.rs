use super::{fetch_page, fetch_updated_since, now_millis, purge_deleted_before, touch_timestamp};
use crate::config::CONTENT_FILE;
use crate::database::models::{EntityAction, ListQuery, NewSetting, Page, Setting, SettingUpdate};
use crate::database::{EntityKind, SpaceRouter};
use crate::error::{EngineError, Result};
use crate::storage::{ContentKind, ContentStore};
use crate::versioning::{content_hash, path_hash};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;

#[async_trait]
pub trait SettingQueries: Send + Sync {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Setting>;
    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Setting>;
    async fn find_by_path_hash_any(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Option<Setting>>;
    async fn create(&self, uid: i64, setting: NewSetting) -> Result<Setting>;
    async fn update(&self, uid: i64, id: i64, update: SettingUpdate) -> Result<Setting>;
    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()>;
    async fn delete(&self, uid: i64, id: i64) -> Result<()>;
    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Setting>>;
    /// Metadata page. `content` is left empty.
    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<Setting>>;
    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>>;
}

#[derive(Clone)]
pub struct SettingRepository {
    router: Arc<SpaceRouter>,
    store: ContentStore,
}

impl SettingRepository {
    pub fn new(router: Arc<SpaceRouter>, store: ContentStore) -> Self {
        Self { router, store }
    }

    async fn pool(&self, uid: i64) -> Result<SqlitePool> {
        self.router.space(uid, EntityKind::Setting).await
    }

    fn folder(&self, uid: i64, id: i64) -> PathBuf {
        self.store.folder(uid, ContentKind::Setting, id)
    }

    async fn fill(&self, uid: i64, mut setting: Setting) -> Result<Setting> {
        setting.content = self
            .store
            .load_or_migrate(&self.folder(uid, setting.id), CONTENT_FILE, &setting.content)
            .await?;
        Ok(setting)
    }
}

#[async_trait]
impl SettingQueries for SettingRepository {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Setting> {
        let pool = self.pool(uid).await?;

        let setting = sqlx::query_as::<_, Setting>("SELECT * FROM setting WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("setting", id))?;

        self.fill(uid, setting).await
    }

    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Setting> {
        let pool = self.pool(uid).await?;

        let setting = sqlx::query_as::<_, Setting>(
            r#"
            SELECT * FROM setting
            WHERE vault_id = ? AND path_hash = ? AND action != 'delete'
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| EngineError::not_found("setting", path_hash))?;

        self.fill(uid, setting).await
    }

    async fn find_by_path_hash_any(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Option<Setting>> {
        let pool = self.pool(uid).await?;

        let setting = sqlx::query_as::<_, Setting>(
            r#"
            SELECT * FROM setting
            WHERE vault_id = ? AND path_hash = ?
            ORDER BY (action = 'delete') ASC, id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?;

        match setting {
            Some(setting) => Ok(Some(self.fill(uid, setting).await?)),
            None => Ok(None),
        }
    }

    async fn create(&self, uid: i64, setting: NewSetting) -> Result<Setting> {
        let pool = self.pool(uid).await?;
        let now = Utc::now();
        let mut tx = pool.begin().await?;

        let mut created = sqlx::query_as::<_, Setting>(
            r#"
            INSERT INTO setting (
                vault_id, action, path, path_hash, content, content_hash,
                size, ctime, mtime, updated_timestamp, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, '', ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(setting.vault_id)
        .bind(EntityAction::Create)
        .bind(&setting.path)
        .bind(path_hash(&setting.path))
        .bind(content_hash(&setting.content))
        .bind(setting.content.len() as i64)
        .bind(setting.ctime)
        .bind(setting.mtime)
        .bind(now_millis())
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        self.store
            .save(&self.folder(uid, created.id), CONTENT_FILE, &setting.content)
            .await?;

        tx.commit().await?;

        created.content = setting.content;
        tracing::debug!("Created setting {} for user {}", created.id, uid);
        Ok(created)
    }

    async fn update(&self, uid: i64, id: i64, update: SettingUpdate) -> Result<Setting> {
        let pool = self.pool(uid).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE setting SET updated_at = ");
        qb.push_bind(Utc::now());
        qb.push(", updated_timestamp = ").push_bind(now_millis());

        if let Some(action) = update.action {
            qb.push(", action = ").push_bind(action);
        }
        if let Some(path) = &update.path {
            qb.push(", path = ").push_bind(path.clone());
            qb.push(", path_hash = ").push_bind(path_hash(path));
        }
        if let Some(content) = &update.content {
            qb.push(", content = '', content_hash = ")
                .push_bind(content_hash(content));
            qb.push(", size = ").push_bind(content.len() as i64);
        }
        if let Some(ctime) = update.ctime {
            qb.push(", ctime = ").push_bind(ctime);
        }
        if let Some(mtime) = update.mtime {
            qb.push(", mtime = ").push_bind(mtime);
        }

        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" RETURNING *");

        let mut tx = pool.begin().await?;

        let setting = qb
            .build_query_as::<Setting>()
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::not_found("setting", id))?;

        if let Some(content) = &update.content {
            self.store
                .save(&self.folder(uid, id), CONTENT_FILE, content)
                .await?;
        }

        tx.commit().await?;

        self.fill(uid, setting).await
    }

    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        if touch_timestamp(&pool, "setting", id, updated_timestamp).await? == 0 {
            return Err(EngineError::not_found("setting", id));
        }
        Ok(())
    }

    async fn delete(&self, uid: i64, id: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query("DELETE FROM setting WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("setting", id));
        }

        self.store.remove_folder(&self.folder(uid, id)).await?;
        Ok(())
    }

    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Setting>> {
        let pool = self.pool(uid).await?;
        let rows = fetch_updated_since::<Setting>(&pool, "setting", vault_id, since).await?;

        let mut filled = Vec::with_capacity(rows.len());
        for setting in rows {
            filled.push(self.fill(uid, setting).await?);
        }
        Ok(filled)
    }

    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<Setting>> {
        let pool = self.pool(uid).await?;
        fetch_page::<Setting>(&pool, "setting", query).await
    }

    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>> {
        let pool = self.pool(uid).await?;
        let ids = purge_deleted_before(&pool, "setting", cutoff).await?;

        for id in &ids {
            if let Err(e) = self.store.remove_folder(&self.folder(uid, *id)).await {
                tracing::warn!("Failed to remove folder of purged setting {}: {}", id, e);
            }
        }
        Ok(ids)
    }
}
