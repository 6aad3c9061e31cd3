use crate::database::models::{NewNoteLink, NoteLink};
use crate::database::{EntityKind, SpaceRouter};
use crate::error::Result;
use crate::versioning::path_hash;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

#[async_trait]
pub trait NoteLinkQueries: Send + Sync {
    /// Replace every outgoing link of `source_note_id`
    async fn replace_for_source(
        &self,
        uid: i64,
        vault_id: i64,
        source_note_id: i64,
        links: Vec<NewNoteLink>,
    ) -> Result<()>;
    async fn delete_by_source(&self, uid: i64, source_note_id: i64) -> Result<()>;
    /// Links from live notes pointing at any of `target_hashes`
    async fn backlinks(&self, uid: i64, vault_id: i64, target_hashes: &[String]) -> Result<Vec<NoteLink>>;
    async fn outlinks(&self, uid: i64, source_note_id: i64) -> Result<Vec<NoteLink>>;
}

#[derive(Clone)]
pub struct NoteLinkRepository {
    router: Arc<SpaceRouter>,
}

impl NoteLinkRepository {
    pub fn new(router: Arc<SpaceRouter>) -> Self {
        Self { router }
    }

    async fn pool(&self, uid: i64) -> Result<SqlitePool> {
        // Backlinks join the note table
        self.router.space(uid, EntityKind::Note).await?;
        self.router.space(uid, EntityKind::NoteLink).await
    }
}

#[async_trait]
impl NoteLinkQueries for NoteLinkRepository {
    async fn replace_for_source(
        &self,
        uid: i64,
        vault_id: i64,
        source_note_id: i64,
        links: Vec<NewNoteLink>,
    ) -> Result<()> {
        let pool = self.pool(uid).await?;
        let now = Utc::now();
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM note_link WHERE source_note_id = ?")
            .bind(source_note_id)
            .execute(&mut *tx)
            .await?;

        for link in &links {
            sqlx::query(
                r#"
                INSERT INTO note_link (
                    source_note_id, target_path, target_path_hash, link_text,
                    is_embed, vault_id, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(source_note_id)
            .bind(&link.target_path)
            .bind(path_hash(&link.target_path))
            .bind(&link.link_text)
            .bind(link.is_embed)
            .bind(vault_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            "Stored {} links of note {} for user {}",
            links.len(),
            source_note_id,
            uid
        );
        Ok(())
    }

    async fn delete_by_source(&self, uid: i64, source_note_id: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        sqlx::query("DELETE FROM note_link WHERE source_note_id = ?")
            .bind(source_note_id)
            .execute(&pool)
            .await?;

        Ok(())
    }

    async fn backlinks(&self, uid: i64, vault_id: i64, target_hashes: &[String]) -> Result<Vec<NoteLink>> {
        if target_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool(uid).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT l.* FROM note_link l
            JOIN note n ON n.id = l.source_note_id
            WHERE n.action != 'delete' AND l.vault_id = "#,
        );
        qb.push_bind(vault_id);
        qb.push(" AND l.target_path_hash IN (");
        let mut separated = qb.separated(", ");
        for hash in target_hashes {
            separated.push_bind(hash.clone());
        }
        separated.push_unseparated(") ORDER BY l.source_note_id ASC, l.id ASC");

        let links = qb.build_query_as::<NoteLink>().fetch_all(&pool).await?;
        Ok(links)
    }

    async fn outlinks(&self, uid: i64, source_note_id: i64) -> Result<Vec<NoteLink>> {
        let pool = self.pool(uid).await?;

        let links = sqlx::query_as::<_, NoteLink>(
            "SELECT * FROM note_link WHERE source_note_id = ? ORDER BY id ASC",
        )
        .bind(source_note_id)
        .fetch_all(&pool)
        .await?;

        Ok(links)
    }
}
