use crate::database::models::Vault;
use crate::database::{EntityKind, SpaceRouter};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Aggregate counters kept on the vault row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaultStats {
    pub note_count: i64,
    pub note_size: i64,
    pub file_count: i64,
    pub file_size: i64,
}

impl From<&Vault> for VaultStats {
    fn from(vault: &Vault) -> Self {
        Self {
            note_count: vault.note_count,
            note_size: vault.note_size,
            file_count: vault.file_count,
            file_size: vault.file_size,
        }
    }
}

#[async_trait]
pub trait VaultQueries: Send + Sync {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Vault>;
    /// Live vault by name
    async fn get_by_name(&self, uid: i64, name: &str) -> Result<Vault>;
    async fn create(&self, uid: i64, name: &str) -> Result<Vault>;
    async fn rename(&self, uid: i64, id: i64, name: &str) -> Result<Vault>;
    async fn list(&self, uid: i64) -> Result<Vec<Vault>>;
    async fn update_note_stats(&self, uid: i64, id: i64, count: i64, size: i64) -> Result<()>;
    async fn update_file_stats(&self, uid: i64, id: i64, count: i64, size: i64) -> Result<()>;
    async fn soft_delete(&self, uid: i64, id: i64) -> Result<()>;
    async fn delete(&self, uid: i64, id: i64) -> Result<()>;
}

#[derive(Clone)]
pub struct VaultRepository {
    router: Arc<SpaceRouter>,
}

impl VaultRepository {
    pub fn new(router: Arc<SpaceRouter>) -> Self {
        Self { router }
    }

    async fn pool(&self, uid: i64) -> Result<SqlitePool> {
        self.router.space(uid, EntityKind::Vault).await
    }

    async fn update_stats(&self, uid: i64, id: i64, sql: &str, count: i64, size: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query(sql)
            .bind(count)
            .bind(size)
            .bind(Utc::now())
            .bind(id)
            .execute(&pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("vault", id));
        }
        Ok(())
    }
}

#[async_trait]
impl VaultQueries for VaultRepository {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Vault> {
        let pool = self.pool(uid).await?;

        sqlx::query_as::<_, Vault>("SELECT * FROM vault WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("vault", id))
    }

    async fn get_by_name(&self, uid: i64, name: &str) -> Result<Vault> {
        let pool = self.pool(uid).await?;

        sqlx::query_as::<_, Vault>(
            "SELECT * FROM vault WHERE name = ? AND is_deleted = 0 ORDER BY id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| EngineError::not_found("vault", name))
    }

    async fn create(&self, uid: i64, name: &str) -> Result<Vault> {
        let pool = self.pool(uid).await?;
        let now = Utc::now();

        let vault = sqlx::query_as::<_, Vault>(
            r#"
            INSERT INTO vault (name, created_at, updated_at)
            VALUES (?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&pool)
        .await?;

        tracing::debug!("Created vault {} for user {}", vault.id, uid);
        Ok(vault)
    }

    async fn rename(&self, uid: i64, id: i64, name: &str) -> Result<Vault> {
        let pool = self.pool(uid).await?;

        sqlx::query_as::<_, Vault>(
            "UPDATE vault SET name = ?, updated_at = ? WHERE id = ? AND is_deleted = 0 RETURNING *",
        )
        .bind(name)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| EngineError::not_found("vault", id))
    }

    async fn list(&self, uid: i64) -> Result<Vec<Vault>> {
        let pool = self.pool(uid).await?;

        let vaults = sqlx::query_as::<_, Vault>(
            "SELECT * FROM vault WHERE is_deleted = 0 ORDER BY id ASC",
        )
        .fetch_all(&pool)
        .await?;

        Ok(vaults)
    }

    async fn update_note_stats(&self, uid: i64, id: i64, count: i64, size: i64) -> Result<()> {
        self.update_stats(
            uid,
            id,
            "UPDATE vault SET note_count = ?, note_size = ?, updated_at = ? WHERE id = ?",
            count,
            size,
        )
        .await
    }

    async fn update_file_stats(&self, uid: i64, id: i64, count: i64, size: i64) -> Result<()> {
        self.update_stats(
            uid,
            id,
            "UPDATE vault SET file_count = ?, file_size = ?, updated_at = ? WHERE id = ?",
            count,
            size,
        )
        .await
    }

    async fn soft_delete(&self, uid: i64, id: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query(
            "UPDATE vault SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("vault", id));
        }

        tracing::debug!("Soft deleted vault {} for user {}", id, uid);
        Ok(())
    }

    async fn delete(&self, uid: i64, id: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query("DELETE FROM vault WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("vault", id));
        }

        tracing::debug!("Hard deleted vault {} for user {}", id, uid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repository::test_support::create_test_space;

    #[tokio::test]
    async fn test_create_get_and_list() {
        let (router, _store, _temp) = create_test_space().await;
        let repo = VaultRepository::new(router);

        let vault = repo.create(1, "Personal").await.unwrap();
        assert_eq!(vault.note_count, 0);

        assert_eq!(repo.get_by_id(1, vault.id).await.unwrap().name, "Personal");
        assert_eq!(repo.get_by_name(1, "Personal").await.unwrap().id, vault.id);
        assert_eq!(repo.list(1).await.unwrap().len(), 1);

        // Another user's space is empty
        assert!(repo.list(2).await.unwrap().is_empty());
        assert!(repo.get_by_name(2, "Personal").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stats_and_soft_delete() {
        let (router, _store, _temp) = create_test_space().await;
        let repo = VaultRepository::new(router);
        let vault = repo.create(1, "Work").await.unwrap();

        repo.update_note_stats(1, vault.id, 3, 120).await.unwrap();
        repo.update_file_stats(1, vault.id, 1, 2048).await.unwrap();

        let fetched = repo.get_by_id(1, vault.id).await.unwrap();
        assert_eq!((fetched.note_count, fetched.note_size), (3, 120));
        assert_eq!((fetched.file_count, fetched.file_size), (1, 2048));

        repo.soft_delete(1, vault.id).await.unwrap();
        assert!(repo.list(1).await.unwrap().is_empty());
        assert!(repo.get_by_id(1, vault.id).await.unwrap().is_deleted);
        assert!(repo.rename(1, vault.id, "x").await.unwrap_err().is_not_found());

        repo.delete(1, vault.id).await.unwrap();
        assert!(repo.get_by_id(1, vault.id).await.unwrap_err().is_not_found());
    }
}
