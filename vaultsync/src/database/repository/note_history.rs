use crate::config::{CONTENT_FILE, DIFF_FILE};
use crate::database::models::{NewNoteHistory, NoteHistory};
use crate::database::{EntityKind, SpaceRouter};
use crate::error::{EngineError, Result};
use crate::storage::{ContentKind, ContentStore};
use crate::versioning::content_hash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

#[async_trait]
pub trait NoteHistoryQueries: Send + Sync {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<NoteHistory>;
    async fn get_by_version(&self, uid: i64, note_id: i64, version: i64) -> Result<NoteHistory>;
    async fn create(&self, uid: i64, history: NewNoteHistory) -> Result<NoteHistory>;
    /// Newest first, with diff and content loaded
    async fn list_by_note(&self, uid: i64, note_id: i64, limit: u32, offset: u32) -> Result<Vec<NoteHistory>>;
    async fn count_by_note(&self, uid: i64, note_id: i64) -> Result<i64>;
    /// Highest recorded version, 0 when the note has no history
    async fn get_latest_version(&self, uid: i64, note_id: i64) -> Result<i64>;
    /// Delete entries older than `cutoff` outside the `keep_versions` newest; returns deleted versions
    async fn delete_old_versions(
        &self,
        uid: i64,
        note_id: i64,
        cutoff: DateTime<Utc>,
        keep_versions: u32,
    ) -> Result<Vec<i64>>;
    /// Notes owning at least one entry older than `cutoff`
    async fn note_ids_with_old_history(&self, uid: i64, cutoff: DateTime<Utc>) -> Result<Vec<i64>>;
    /// Drop every entry of a note (used when the note itself is purged)
    async fn delete_by_note(&self, uid: i64, note_id: i64) -> Result<usize>;
    /// Move every entry of `from_note_id` to `to_note_id`; returns the count moved
    async fn reassign_note(&self, uid: i64, from_note_id: i64, to_note_id: i64) -> Result<u64>;
    /// Newest entry of a note whose content hashes to `content_hash`
    async fn find_by_content_hash(
        &self,
        uid: i64,
        note_id: i64,
        content_hash: &str,
    ) -> Result<Option<NoteHistory>>;
}

#[derive(Clone)]
pub struct NoteHistoryRepository {
    router: Arc<SpaceRouter>,
    store: ContentStore,
}

impl NoteHistoryRepository {
    pub fn new(router: Arc<SpaceRouter>, store: ContentStore) -> Self {
        Self { router, store }
    }

    async fn pool(&self, uid: i64) -> Result<SqlitePool> {
        self.router.space(uid, EntityKind::NoteHistory).await
    }

    fn folder(&self, uid: i64, id: i64) -> PathBuf {
        self.store.folder(uid, ContentKind::History, id)
    }

    async fn fill(&self, uid: i64, mut history: NoteHistory) -> Result<NoteHistory> {
        let folder = self.folder(uid, history.id);
        history.diffs = self
            .store
            .load_or_migrate(&folder, DIFF_FILE, &history.diffs)
            .await?;
        history.content = self
            .store
            .load_or_migrate(&folder, CONTENT_FILE, &history.content)
            .await?;
        Ok(history)
    }

    async fn remove_folders(&self, uid: i64, ids: &[i64]) {
        for id in ids {
            if let Err(e) = self.store.remove_folder(&self.folder(uid, *id)).await {
                tracing::warn!("Failed to remove history folder {}: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl NoteHistoryQueries for NoteHistoryRepository {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<NoteHistory> {
        let pool = self.pool(uid).await?;

        let history = sqlx::query_as::<_, NoteHistory>("SELECT * FROM note_history WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("note history", id))?;

        self.fill(uid, history).await
    }

    async fn get_by_version(&self, uid: i64, note_id: i64, version: i64) -> Result<NoteHistory> {
        let pool = self.pool(uid).await?;

        let history = sqlx::query_as::<_, NoteHistory>(
            "SELECT * FROM note_history WHERE note_id = ? AND version = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(note_id)
        .bind(version)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| EngineError::not_found("note history", format!("{}@{}", note_id, version)))?;

        self.fill(uid, history).await
    }

    async fn create(&self, uid: i64, history: NewNoteHistory) -> Result<NoteHistory> {
        let pool = self.pool(uid).await?;
        let mut tx = pool.begin().await?;

        let mut created = sqlx::query_as::<_, NoteHistory>(
            r#"
            INSERT INTO note_history (
                note_id, vault_id, path, diffs, content, content_hash,
                client_name, version, created_at
            )
            VALUES (?, ?, ?, '', '', ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(history.note_id)
        .bind(history.vault_id)
        .bind(&history.path)
        .bind(content_hash(&history.content))
        .bind(&history.client_name)
        .bind(history.version)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        let folder = self.folder(uid, created.id);
        self.store.save(&folder, DIFF_FILE, &history.diffs).await?;
        self.store.save(&folder, CONTENT_FILE, &history.content).await?;

        tx.commit().await?;

        created.diffs = history.diffs;
        created.content = history.content;

        tracing::debug!(
            "Recorded version {} of note {} for user {}",
            created.version,
            created.note_id,
            uid
        );
        Ok(created)
    }

    async fn list_by_note(&self, uid: i64, note_id: i64, limit: u32, offset: u32) -> Result<Vec<NoteHistory>> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query_as::<_, NoteHistory>(
            r#"
            SELECT * FROM note_history
            WHERE note_id = ?
            ORDER BY version DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(note_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&pool)
        .await?;

        let mut filled = Vec::with_capacity(rows.len());
        for history in rows {
            filled.push(self.fill(uid, history).await?);
        }
        Ok(filled)
    }

    async fn count_by_note(&self, uid: i64, note_id: i64) -> Result<i64> {
        let pool = self.pool(uid).await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM note_history WHERE note_id = ?")
            .bind(note_id)
            .fetch_one(&pool)
            .await?;

        Ok(count)
    }

    async fn get_latest_version(&self, uid: i64, note_id: i64) -> Result<i64> {
        let pool = self.pool(uid).await?;

        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM note_history WHERE note_id = ?")
                .bind(note_id)
                .fetch_one(&pool)
                .await?;

        Ok(version)
    }

    async fn delete_old_versions(
        &self,
        uid: i64,
        note_id: i64,
        cutoff: DateTime<Utc>,
        keep_versions: u32,
    ) -> Result<Vec<i64>> {
        let pool = self.pool(uid).await?;

        // Lowest version among the newest `keep_versions`; everything at or above it stays
        let min_keep: Option<i64> = if keep_versions == 0 {
            None
        } else {
            sqlx::query_scalar(
                r#"
                SELECT MIN(version) FROM (
                    SELECT version FROM note_history
                    WHERE note_id = ?
                    ORDER BY version DESC
                    LIMIT ?
                )
                "#,
            )
            .bind(note_id)
            .bind(i64::from(keep_versions))
            .fetch_one(&pool)
            .await?
        };

        let deleted: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            DELETE FROM note_history
            WHERE note_id = ?
              AND julianday(created_at) < julianday(?)
              AND version < ?
            RETURNING id, version
            "#,
        )
        .bind(note_id)
        .bind(cutoff)
        .bind(min_keep.unwrap_or(i64::MAX))
        .fetch_all(&pool)
        .await?;

        let ids: Vec<i64> = deleted.iter().map(|(id, _)| *id).collect();
        self.remove_folders(uid, &ids).await;

        let mut versions: Vec<i64> = deleted.into_iter().map(|(_, v)| v).collect();
        versions.sort_unstable();

        if !versions.is_empty() {
            tracing::debug!(
                "Pruned {} history entries of note {} for user {}",
                versions.len(),
                note_id,
                uid
            );
        }
        Ok(versions)
    }

    async fn note_ids_with_old_history(&self, uid: i64, cutoff: DateTime<Utc>) -> Result<Vec<i64>> {
        let pool = self.pool(uid).await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT note_id FROM note_history
            WHERE julianday(created_at) < julianday(?)
            ORDER BY note_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&pool)
        .await?;

        Ok(ids)
    }

    async fn delete_by_note(&self, uid: i64, note_id: i64) -> Result<usize> {
        let pool = self.pool(uid).await?;

        let ids: Vec<i64> =
            sqlx::query_scalar("DELETE FROM note_history WHERE note_id = ? RETURNING id")
                .bind(note_id)
                .fetch_all(&pool)
                .await?;

        self.remove_folders(uid, &ids).await;
        Ok(ids.len())
    }

    async fn reassign_note(&self, uid: i64, from_note_id: i64, to_note_id: i64) -> Result<u64> {
        let pool = self.pool(uid).await?;

        let result = sqlx::query("UPDATE note_history SET note_id = ? WHERE note_id = ?")
            .bind(to_note_id)
            .bind(from_note_id)
            .execute(&pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn find_by_content_hash(
        &self,
        uid: i64,
        note_id: i64,
        content_hash: &str,
    ) -> Result<Option<NoteHistory>> {
        let pool = self.pool(uid).await?;

        let history = sqlx::query_as::<_, NoteHistory>(
            r#"
            SELECT * FROM note_history
            WHERE note_id = ? AND content_hash = ?
            ORDER BY version DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(note_id)
        .bind(content_hash)
        .fetch_optional(&pool)
        .await?;

        match history {
            Some(history) => Ok(Some(self.fill(uid, history).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repository::test_support::create_test_space;
    use chrono::Duration;

    fn entry(note_id: i64, version: i64, content: &str) -> NewNoteHistory {
        NewNoteHistory {
            note_id,
            vault_id: 1,
            path: "a.md".to_string(),
            diffs: "[]".to_string(),
            content: content.to_string(),
            client_name: "test".to_string(),
            version,
        }
    }

    async fn set_created_at(repo: &NoteHistoryRepository, id: i64, at: DateTime<Utc>) {
        let pool = repo.pool(1).await.unwrap();
        sqlx::query("UPDATE note_history SET created_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteHistoryRepository::new(router, store);

        let created = repo.create(1, entry(7, 1, "body v1")).await.unwrap();
        assert_eq!(created.content_hash, content_hash("body v1"));

        let fetched = repo.get_by_id(1, created.id).await.unwrap();
        assert_eq!(fetched.content, "body v1");
        assert_eq!(fetched.diffs, "[]");

        let by_version = repo.get_by_version(1, 7, 1).await.unwrap();
        assert_eq!(by_version.id, created.id);

        assert_eq!(repo.get_latest_version(1, 7).await.unwrap(), 1);
        assert_eq!(repo.get_latest_version(1, 8).await.unwrap(), 0);
        assert!(repo.get_by_version(1, 7, 2).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_by_note_newest_first() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteHistoryRepository::new(router, store);

        for version in 1..=3 {
            repo.create(1, entry(7, version, "x")).await.unwrap();
        }
        repo.create(1, entry(8, 1, "y")).await.unwrap();

        let listed = repo.list_by_note(1, 7, 10, 0).await.unwrap();
        let versions: Vec<i64> = listed.iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert!(listed.iter().all(|h| h.content == "x" && h.diffs == "[]"));
        assert_eq!(repo.count_by_note(1, 7).await.unwrap(), 3);
        assert_eq!(repo.list_by_note(1, 7, 1, 1).await.unwrap()[0].version, 2);
    }

    #[tokio::test]
    async fn test_delete_old_versions_respects_cutoff_and_keep_floor() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteHistoryRepository::new(router, store.clone());

        let now = Utc::now();
        let cutoff = now - Duration::days(7);
        let mut ids = Vec::new();

        for version in 1..=10 {
            let created = repo.create(1, entry(7, version, "x")).await.unwrap();
            // Versions 1..=3 were re-imported recently, 4..=7 are old, 8..=10 are old too
            let at = match version {
                1..=3 => now - Duration::days(1),
                _ => now - Duration::days(30),
            };
            set_created_at(&repo, created.id, at).await;
            ids.push(created.id);
        }

        let deleted = repo.delete_old_versions(1, 7, cutoff, 3).await.unwrap();
        assert_eq!(deleted, vec![4, 5, 6, 7]);

        let mut remaining: Vec<i64> = repo
            .list_by_note(1, 7, 100, 0)
            .await
            .unwrap()
            .iter()
            .map(|h| h.version)
            .collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![1, 2, 3, 8, 9, 10]);

        // Folders of deleted entries are gone
        assert!(!store.folder(1, ContentKind::History, ids[4]).exists());
        assert!(store.folder(1, ContentKind::History, ids[8]).exists());
    }

    #[tokio::test]
    async fn test_old_history_discovery_and_note_purge() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteHistoryRepository::new(router, store);

        let old = repo.create(1, entry(7, 1, "x")).await.unwrap();
        set_created_at(&repo, old.id, Utc::now() - Duration::days(30)).await;
        repo.create(1, entry(8, 1, "y")).await.unwrap();

        let ids = repo
            .note_ids_with_old_history(1, Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(ids, vec![7]);

        assert_eq!(repo.delete_by_note(1, 8).await.unwrap(), 1);
        assert_eq!(repo.count_by_note(1, 8).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reassign_and_find_by_content() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteHistoryRepository::new(router, store);

        repo.create(1, entry(7, 1, "first")).await.unwrap();
        repo.create(1, entry(7, 2, "second")).await.unwrap();

        assert_eq!(repo.reassign_note(1, 7, 9).await.unwrap(), 2);
        assert_eq!(repo.count_by_note(1, 7).await.unwrap(), 0);
        assert_eq!(repo.get_latest_version(1, 9).await.unwrap(), 2);

        let found = repo
            .find_by_content_hash(1, 9, &content_hash("first"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.version, 1);
        assert_eq!(found.content, "first");
        assert!(repo
            .find_by_content_hash(1, 9, &content_hash("missing"))
            .await
            .unwrap()
            .is_none());
    }
}
