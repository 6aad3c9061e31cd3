use super::{fetch_page, fetch_updated_since, now_millis, purge_deleted_before, touch_timestamp};
use crate::database::models::{EntityAction, Folder, FolderUpdate, ListQuery, NewFolder, Page};
use crate::database::{EntityKind, SpaceRouter};
use crate::error::{EngineError, Result};
use crate::versioning::path_hash;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

#[async_trait]
pub trait FolderQueries: Send + Sync {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Folder>;
    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Folder>;
    async fn find_by_path_hash_any(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Option<Folder>>;
    async fn create(&self, uid: i64, folder: NewFolder) -> Result<Folder>;
    async fn update(&self, uid: i64, id: i64, update: FolderUpdate) -> Result<Folder>;
    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()>;
    async fn delete(&self, uid: i64, id: i64) -> Result<()>;
    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Folder>>;
    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<Folder>>;
    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>>;
}

#[derive(Clone)]
pub struct FolderRepository {
    router: Arc<SpaceRouter>,
}

impl FolderRepository {
    pub fn new(router: Arc<SpaceRouter>) -> Self {
        Self { router }
    }

    async fn pool(&self, uid: i64) -> Result<SqlitePool> {
        self.router.space(uid, EntityKind::Folder).await
    }
}

/// Nesting depth of a slash-separated path ("a" is 1, "a/b" is 2)
pub fn folder_level(path: &str) -> i64 {
    path.split('/').filter(|s| !s.is_empty()).count() as i64
}

#[async_trait]
impl FolderQueries for FolderRepository {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Folder> {
        let pool = self.pool(uid).await?;

        sqlx::query_as::<_, Folder>("SELECT * FROM folder WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("folder", id))
    }

    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Folder> {
        let pool = self.pool(uid).await?;

        sqlx::query_as::<_, Folder>(
            r#"
            SELECT * FROM folder
            WHERE vault_id = ? AND path_hash = ? AND action != 'delete'
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| EngineError::not_found("folder", path_hash))
    }

    async fn find_by_path_hash_any(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Option<Folder>> {
        let pool = self.pool(uid).await?;

        let folder = sqlx::query_as::<_, Folder>(
            r#"
            SELECT * FROM folder
            WHERE vault_id = ? AND path_hash = ?
            ORDER BY (action = 'delete') ASC, id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?;

        Ok(folder)
    }

    async fn create(&self, uid: i64, folder: NewFolder) -> Result<Folder> {
        let pool = self.pool(uid).await?;
        let now = Utc::now();

        let created = sqlx::query_as::<_, Folder>(
            r#"
            INSERT INTO folder (
                vault_id, action, path, path_hash, level, fid,
                ctime, mtime, updated_timestamp, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(folder.vault_id)
        .bind(EntityAction::Create)
        .bind(&folder.path)
        .bind(path_hash(&folder.path))
        .bind(folder_level(&folder.path))
        .bind(folder.fid)
        .bind(folder.ctime)
        .bind(folder.mtime)
        .bind(now_millis())
        .bind(now)
        .bind(now)
        .fetch_one(&pool)
        .await?;

        tracing::debug!("Created folder {} ({}) for user {}", created.id, created.path, uid);
        Ok(created)
    }

    async fn update(&self, uid: i64, id: i64, update: FolderUpdate) -> Result<Folder> {
        let pool = self.pool(uid).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE folder SET updated_at = ");
        qb.push_bind(Utc::now());
        qb.push(", updated_timestamp = ").push_bind(now_millis());

        if let Some(action) = update.action {
            qb.push(", action = ").push_bind(action);
        }
        if let Some(path) = update.path {
            qb.push(", path_hash = ").push_bind(path_hash(&path));
            qb.push(", level = ").push_bind(folder_level(&path));
            qb.push(", path = ").push_bind(path);
        }
        if let Some(fid) = update.fid {
            qb.push(", fid = ").push_bind(fid);
        }
        if let Some(mtime) = update.mtime {
            qb.push(", mtime = ").push_bind(mtime);
        }

        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" RETURNING *");

        qb.build_query_as::<Folder>()
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("folder", id))
    }

    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        if touch_timestamp(&pool, "folder", id, updated_timestamp).await? == 0 {
            return Err(EngineError::not_found("folder", id));
        }
        Ok(())
    }

    async fn delete(&self, uid: i64, id: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query("DELETE FROM folder WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("folder", id));
        }

        tracing::debug!("Hard deleted folder {} for user {}", id, uid);
        Ok(())
    }

    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Folder>> {
        let pool = self.pool(uid).await?;
        fetch_updated_since::<Folder>(&pool, "folder", vault_id, since).await
    }

    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<Folder>> {
        let pool = self.pool(uid).await?;
        fetch_page::<Folder>(&pool, "folder", query).await
    }

    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>> {
        let pool = self.pool(uid).await?;
        purge_deleted_before(&pool, "folder", cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repository::test_support::create_test_space;

    #[test]
    fn test_folder_level() {
        assert_eq!(folder_level("a"), 1);
        assert_eq!(folder_level("a/b/c"), 3);
        assert_eq!(folder_level("/a//b/"), 2);
    }

    #[tokio::test]
    async fn test_folder_lifecycle() {
        let (router, _store, _temp) = create_test_space().await;
        let repo = FolderRepository::new(router);

        let parent = repo
            .create(
                1,
                NewFolder {
                    vault_id: 1,
                    path: "projects".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let child = repo
            .create(
                1,
                NewFolder {
                    vault_id: 1,
                    path: "projects/rust".to_string(),
                    fid: parent.id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(child.level, 2);

        let found = repo
            .get_by_path_hash(1, 1, &path_hash("projects/rust"))
            .await
            .unwrap();
        assert_eq!(found.id, child.id);

        let moved = repo
            .update(
                1,
                child.id,
                FolderUpdate {
                    path: Some("archive/projects/rust".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.level, 3);
        assert_eq!(moved.path_hash, path_hash("archive/projects/rust"));

        repo.update(
            1,
            parent.id,
            FolderUpdate {
                action: Some(EntityAction::Delete),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(repo.list_paged(1, &ListQuery::for_vault(1)).await.unwrap().total, 1);
        assert!(repo
            .find_by_path_hash_any(1, 1, &path_hash("projects"))
            .await
            .unwrap()
            .is_some());

        assert_eq!(repo.delete_physical_by_time(1, i64::MAX).await.unwrap(), vec![parent.id]);
        assert_eq!(repo.list_by_updated_since(1, 1, 0).await.unwrap().len(), 1);

        repo.update_timestamp_only(1, child.id, 42).await.unwrap();
        assert_eq!(repo.get_by_id(1, child.id).await.unwrap().updated_timestamp, 42);

        repo.delete(1, child.id).await.unwrap();
        assert!(repo.get_by_id(1, child.id).await.unwrap_err().is_not_found());
    }
}
