use crate::database::models::User;
use crate::error::{EngineError, Result};
use chrono::Utc;
use sqlx::SqlitePool;

/// Global user registry
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, username: &str) -> Result<User> {
        let now = Utc::now();

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, is_deleted, created_at, updated_at)
            VALUES (?, 0, ?, ?)
            RETURNING *
            "#,
        )
        .bind(username)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!("Registered user {} ({})", user.uid, username);
        Ok(user)
    }

    pub async fn get(&self, uid: i64) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::not_found("user", uid))
    }

    pub async fn get_by_username(&self, username: &str) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ? AND is_deleted = 0")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::not_found("user", username))
    }

    /// Soft delete. The user's space stays on disk for manual cleanup.
    pub async fn soft_delete(&self, uid: i64) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE users SET is_deleted = 1, updated_at = ? WHERE uid = ? AND is_deleted = 0",
        )
        .bind(Utc::now())
        .bind(uid)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("user", uid));
        }

        tracing::info!("Soft deleted user {}", uid);
        Ok(())
    }
}
