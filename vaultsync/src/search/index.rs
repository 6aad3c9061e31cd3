//! Per-user note FTS index
//!
//! The index is derived data. It is created lazily on first use per user,
//! rebuilt from the content store when its schema version changes, and
//! queried with a LIKE scan whenever the MATCH query fails or finds nothing.

use super::tokenizer::{build_match_query, escape_like};
use crate::config::{MAX_SEARCH_PAGE_SIZE, NOTE_FTS_VERSION};
use crate::database::models::Note;
use crate::database::repository::{NoteQueries, NoteRepository};
use crate::database::{EntityKind, SpaceRouter};
use crate::error::{EngineError, Result};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;

const CREATE_META: &str =
    "CREATE TABLE IF NOT EXISTS note_fts_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)";

const CREATE_FTS: &str = r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS note_fts USING fts5(
        note_id UNINDEXED,
        path,
        content,
        tokenize = 'unicode61 remove_diacritics 2'
    )
"#;

/// One search result
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SearchHit {
    pub note_id: i64,
    pub path: String,
    pub mtime: i64,
}

#[derive(Clone)]
pub struct FtsIndex {
    router: Arc<SpaceRouter>,
    notes: NoteRepository,
}

impl FtsIndex {
    pub fn new(router: Arc<SpaceRouter>, notes: NoteRepository) -> Self {
        Self { router, notes }
    }

    /// Handle with the index opened for `uid`.
    ///
    /// Creation and version migration run once per user; failures are logged
    /// and show up later as failing index statements.
    pub async fn ensure(&self, uid: i64) -> Result<SqlitePool> {
        let pool = self.router.space(uid, EntityKind::Note).await?;
        let key = format!("{}#note_fts", SpaceRouter::db_key(uid));

        let (this, pool_ref) = (self, &pool);
        self.router
            .run_once(key, move || async move {
                if let Err(e) = this.migrate(uid, pool_ref).await {
                    tracing::warn!("Failed to prepare search index for user {}: {}", uid, e);
                }
            })
            .await?;

        Ok(pool)
    }

    async fn migrate(&self, uid: i64, pool: &SqlitePool) -> Result<()> {
        sqlx::query(CREATE_META).execute(pool).await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM note_fts_meta WHERE key = 'version'")
                .fetch_optional(pool)
                .await?;

        if stored.as_deref() != Some(NOTE_FTS_VERSION) {
            tracing::info!(
                "Search index for user {} at version {:?}, rebuilding as {}",
                uid,
                stored,
                NOTE_FTS_VERSION
            );

            sqlx::query("DROP TABLE IF EXISTS note_fts").execute(pool).await?;
            sqlx::query(CREATE_FTS).execute(pool).await?;
            self.rebuild_into(uid, pool).await?;

            sqlx::query(
                r#"
                INSERT INTO note_fts_meta (key, value) VALUES ('version', ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(NOTE_FTS_VERSION)
            .execute(pool)
            .await?;

            return Ok(());
        }

        sqlx::query(CREATE_FTS).execute(pool).await?;

        // Index lost while notes survived
        let indexed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM note_fts")
            .fetch_one(pool)
            .await?;
        let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM note WHERE action != 'delete'")
            .fetch_one(pool)
            .await?;

        if indexed == 0 && live > 0 {
            tracing::info!("Search index for user {} is empty, rebuilding", uid);
            self.rebuild_into(uid, pool).await?;
        }

        Ok(())
    }

    async fn rebuild_into(&self, uid: i64, pool: &SqlitePool) -> Result<usize> {
        let notes = self.notes.list_live(uid).await?;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM note_fts").execute(&mut *tx).await?;
        for note in &notes {
            sqlx::query("INSERT INTO note_fts (note_id, path, content) VALUES (?, ?, ?)")
                .bind(note.id)
                .bind(&note.path)
                .bind(&note.content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!("Indexed {} notes for user {}", notes.len(), uid);
        Ok(notes.len())
    }

    /// Re-index every live note of a user from the content store.
    pub async fn rebuild(&self, uid: i64) -> Result<usize> {
        let pool = self.ensure(uid).await?;
        self.rebuild_into(uid, &pool).await
    }

    pub async fn upsert(&self, uid: i64, note: &Note) -> Result<()> {
        let pool = self.ensure(uid).await?;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM note_fts WHERE note_id = ?")
            .bind(note.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO note_fts (note_id, path, content) VALUES (?, ?, ?)")
            .bind(note.id)
            .bind(&note.path)
            .bind(&note.content)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove(&self, uid: i64, note_id: i64) -> Result<()> {
        let pool = self.ensure(uid).await?;

        sqlx::query("DELETE FROM note_fts WHERE note_id = ?")
            .bind(note_id)
            .execute(&pool)
            .await?;
        Ok(())
    }

    /// Live notes of `vault_id` matching `keyword`.
    ///
    /// Returns `SearchUnavailable` only when the LIKE fallback fails as well;
    /// an empty vector means nothing matched.
    pub async fn search(
        &self,
        uid: i64,
        vault_id: i64,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<SearchHit>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Ok(Vec::new());
        }

        match build_match_query(keyword) {
            Some(expr) => self.search_with(uid, vault_id, &expr, keyword, limit).await,
            None => {
                let pool = self.ensure(uid).await?;
                let limit = limit.clamp(1, MAX_SEARCH_PAGE_SIZE);
                self.like_search(&pool, vault_id, keyword, limit)
                    .await
                    .map_err(|e| EngineError::SearchUnavailable(e.to_string()))
            }
        }
    }

    /// MATCH with `expr`, falling back to a LIKE scan for `keyword`.
    pub(crate) async fn search_with(
        &self,
        uid: i64,
        vault_id: i64,
        expr: &str,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<SearchHit>> {
        let pool = self.ensure(uid).await?;
        let limit = limit.clamp(1, MAX_SEARCH_PAGE_SIZE);

        let primary_error = match self.match_search(&pool, vault_id, expr, limit).await {
            Ok(hits) if !hits.is_empty() => return Ok(hits),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Search match failed for user {}, using LIKE scan: {}", uid, e);
                Some(e)
            }
        };

        match self.like_search(&pool, vault_id, keyword, limit).await {
            Ok(hits) => Ok(hits),
            Err(e) => {
                tracing::warn!("Search fallback failed for user {}: {}", uid, e);
                let reason = match primary_error {
                    Some(primary) => format!("match: {}; like: {}", primary, e),
                    None => e.to_string(),
                };
                Err(EngineError::SearchUnavailable(reason))
            }
        }
    }

    async fn match_search(
        &self,
        pool: &SqlitePool,
        vault_id: i64,
        expr: &str,
        limit: u32,
    ) -> Result<Vec<SearchHit>> {
        let hits = sqlx::query_as::<_, SearchHit>(
            r#"
            SELECT n.id AS note_id, n.path AS path, n.mtime AS mtime
            FROM note_fts
            JOIN note n ON n.id = CAST(note_fts.note_id AS INTEGER)
            WHERE note_fts MATCH ?
              AND n.vault_id = ?
              AND n.action != 'delete'
            ORDER BY note_fts.rank
            LIMIT ?
            "#,
        )
        .bind(expr)
        .bind(vault_id)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

        Ok(hits)
    }

    async fn like_search(
        &self,
        pool: &SqlitePool,
        vault_id: i64,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<SearchHit>> {
        let pattern = format!("%{}%", escape_like(keyword));

        let hits = sqlx::query_as::<_, SearchHit>(
            r#"
            SELECT n.id AS note_id, n.path AS path, n.mtime AS mtime
            FROM note_fts
            JOIN note n ON n.id = CAST(note_fts.note_id AS INTEGER)
            WHERE n.vault_id = ?
              AND n.action != 'delete'
              AND (note_fts.content LIKE ? ESCAPE '\' OR note_fts.path LIKE ? ESCAPE '\')
            ORDER BY n.mtime DESC, n.id DESC
            LIMIT ?
            "#,
        )
        .bind(vault_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{EntityAction, NewNote, NoteUpdate};
    use crate::database::repository::test_support::create_test_space;

    async fn create_test_index() -> (FtsIndex, NoteRepository, tempfile::TempDir) {
        let (router, store, temp) = create_test_space().await;
        let notes = NoteRepository::new(Arc::clone(&router), store);
        (FtsIndex::new(router, notes.clone()), notes, temp)
    }

    async fn add_note(notes: &NoteRepository, index: &FtsIndex, path: &str, content: &str) -> Note {
        let note = notes
            .create(
                1,
                NewNote {
                    vault_id: 1,
                    path: path.to_string(),
                    content: content.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        index.upsert(1, &note).await.unwrap();
        note
    }

    #[tokio::test]
    async fn test_cjk_and_latin_search() {
        let (index, notes, _temp) = create_test_index().await;
        let cjk = add_note(&notes, &index, "cn.md", "测试笔记").await;
        let latin = add_note(&notes, &index, "en.md", "hello world").await;

        let hits = index.search(1, 1, "测试", 20).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note_id, cjk.id);

        let hits = index.search(1, 1, "hel", 20).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note_id, latin.id);
    }

    #[tokio::test]
    async fn test_broken_match_expression_falls_back() {
        let (index, notes, _temp) = create_test_index().await;
        let cjk = add_note(&notes, &index, "cn.md", "测试笔记").await;
        add_note(&notes, &index, "en.md", "hello world").await;

        // Unbalanced quote is an FTS5 syntax error
        let hits = index.search_with(1, 1, "\"测试", "测试", 20).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note_id, cjk.id);
    }

    #[tokio::test]
    async fn test_special_characters_do_not_fail() {
        let (index, notes, _temp) = create_test_index().await;
        let note = add_note(&notes, &index, "odd.md", "100% done_ok").await;

        for keyword in ["100%", "done_", "\"", "a OR", "NEAR(", "*", "(", ")", ":"] {
            let result = index.search(1, 1, keyword, 20).await;
            assert!(result.is_ok(), "keyword {:?} failed: {:?}", keyword, result);
        }

        let hits = index.search(1, 1, "100%", 20).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note_id, note.id);
        assert!(index.search(1, 1, "   ", 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_and_foreign_vault_notes_excluded() {
        let (index, notes, _temp) = create_test_index().await;
        let note = add_note(&notes, &index, "gone.md", "needle").await;

        let other = notes
            .create(
                1,
                NewNote {
                    vault_id: 2,
                    path: "other.md".to_string(),
                    content: "needle".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        index.upsert(1, &other).await.unwrap();

        assert_eq!(index.search(1, 1, "needle", 20).await.unwrap().len(), 1);

        notes
            .update(
                1,
                note.id,
                NoteUpdate {
                    action: Some(EntityAction::Delete),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(index.search(1, 1, "needle", 20).await.unwrap().is_empty());

        index.remove(1, other.id).await.unwrap();
        assert!(index.search(1, 2, "needle", 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_change_rebuilds_index() {
        let (index, notes, _temp) = create_test_index().await;
        let note = add_note(&notes, &index, "a.md", "rebuild me").await;

        let pool = index.ensure(1).await.unwrap();
        sqlx::query("UPDATE note_fts_meta SET value = '1' WHERE key = 'version'")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM note_fts").execute(&pool).await.unwrap();

        // Fresh index instance over the same files re-runs the version check
        let reopened = FtsIndex::new(index.router.clone(), notes.clone());
        reopened.migrate(1, &pool).await.unwrap();

        let hits = reopened.search(1, 1, "rebuild", 20).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note_id, note.id);

        let version: String =
            sqlx::query_scalar("SELECT value FROM note_fts_meta WHERE key = 'version'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(version, NOTE_FTS_VERSION);
    }

    #[tokio::test]
    async fn test_rebuild_counts_live_notes() {
        let (index, notes, _temp) = create_test_index().await;
        add_note(&notes, &index, "a.md", "one").await;
        add_note(&notes, &index, "b.md", "two").await;

        assert_eq!(index.rebuild(1).await.unwrap(), 2);
    }
}
