//! Note repository
//!
//! Note bodies and snapshots are written to the content store; the row keeps
//! hashes, sizes and sync metadata. Reads fill the bodies back in, migrating
//! legacy inline values on the way.

use super::{fetch_page, fetch_updated_since, now_millis, purge_deleted_before, touch_timestamp};
use crate::config::{CONTENT_FILE, SNAPSHOT_FILE};
use crate::database::models::{EntityAction, ListQuery, NewNote, Note, NoteUpdate, Page};
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
pub trait NoteQueries: Send + Sync {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Note>;
    /// Exact path-hash match among live notes
    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Note>;
    /// Path-hash match that also considers deleted notes, live rows first
    async fn find_by_path_hash_any(
        &self,
        uid: i64,
        vault_id: i64,
        path_hash: &str,
    ) -> Result<Option<Note>>;
    async fn create(&self, uid: i64, note: NewNote) -> Result<Note>;
    async fn update(&self, uid: i64, id: i64, update: NoteUpdate) -> Result<Note>;
    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()>;
    async fn delete(&self, uid: i64, id: i64) -> Result<()>;
    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Note>>;
    /// Metadata page. Body fields are left empty.
    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<Note>>;
    /// Record `snapshot` as the diff base for the next history entry
    async fn update_snapshot(&self, uid: i64, id: i64, snapshot: &str) -> Result<()>;
    /// Live notes whose content has not been snapshotted yet, last written at or before `updated_before` (ms)
    async fn list_by_content_unchanged(&self, uid: i64, updated_before: i64) -> Result<Vec<Note>>;
    /// Every live note in the user space, bodies filled
    async fn list_live(&self, uid: i64) -> Result<Vec<Note>>;
    /// (count, total size) of live notes in a vault
    async fn count_size_sum(&self, uid: i64, vault_id: i64) -> Result<(i64, i64)>;
    /// Hard delete notes soft-deleted before `cutoff` (ms) and their folders
    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>>;
}

#[derive(Clone)]
pub struct NoteRepository {
    router: Arc<SpaceRouter>,
    store: ContentStore,
}

impl NoteRepository {
    pub fn new(router: Arc<SpaceRouter>, store: ContentStore) -> Self {
        Self { router, store }
    }

    async fn pool(&self, uid: i64) -> Result<SqlitePool> {
        self.router.space(uid, EntityKind::Note).await
    }

    fn folder(&self, uid: i64, id: i64) -> PathBuf {
        self.store.folder(uid, ContentKind::Note, id)
    }

    /// Replace row bodies with content store values.
    async fn fill(&self, uid: i64, mut note: Note) -> Result<Note> {
        let folder = self.folder(uid, note.id);
        note.content = self
            .store
            .load_or_migrate(&folder, CONTENT_FILE, &note.content)
            .await?;
        note.content_last_snapshot = self
            .store
            .load_or_migrate(&folder, SNAPSHOT_FILE, &note.content_last_snapshot)
            .await?;
        Ok(note)
    }

    async fn fill_all(&self, uid: i64, notes: Vec<Note>) -> Result<Vec<Note>> {
        let mut filled = Vec::with_capacity(notes.len());
        for note in notes {
            filled.push(self.fill(uid, note).await?);
        }
        Ok(filled)
    }
}

#[async_trait]
impl NoteQueries for NoteRepository {
    async fn get_by_id(&self, uid: i64, id: i64) -> Result<Note> {
        let pool = self.pool(uid).await?;

        let note = sqlx::query_as::<_, Note>("SELECT * FROM note WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| EngineError::not_found("note", id))?;

        self.fill(uid, note).await
    }

    async fn get_by_path_hash(&self, uid: i64, vault_id: i64, path_hash: &str) -> Result<Note> {
        let pool = self.pool(uid).await?;

        let note = sqlx::query_as::<_, Note>(
            r#"
            SELECT * FROM note
            WHERE vault_id = ? AND path_hash = ? AND action != 'delete'
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| EngineError::not_found("note", path_hash))?;

        self.fill(uid, note).await
    }

    async fn find_by_path_hash_any(
        &self,
        uid: i64,
        vault_id: i64,
        path_hash: &str,
    ) -> Result<Option<Note>> {
        let pool = self.pool(uid).await?;

        let note = sqlx::query_as::<_, Note>(
            r#"
            SELECT * FROM note
            WHERE vault_id = ? AND path_hash = ?
            ORDER BY (action = 'delete') ASC, id DESC LIMIT 1
            "#,
        )
        .bind(vault_id)
        .bind(path_hash)
        .fetch_optional(&pool)
        .await?;

        match note {
            Some(note) => Ok(Some(self.fill(uid, note).await?)),
            None => Ok(None),
        }
    }

    async fn create(&self, uid: i64, note: NewNote) -> Result<Note> {
        let pool = self.pool(uid).await?;
        let now = Utc::now();
        let hash = content_hash(&note.content);

        let mut tx = pool.begin().await?;

        let mut created = sqlx::query_as::<_, Note>(
            r#"
            INSERT INTO note (
                vault_id, fid, action, rename, path, path_hash,
                content, content_hash, content_last_snapshot, content_last_snapshot_hash,
                version, client_name, size, ctime, mtime, updated_timestamp,
                created_at, updated_at
            )
            VALUES (?, ?, ?, 0, ?, ?, '', ?, '', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(note.vault_id)
        .bind(note.fid)
        .bind(EntityAction::Create)
        .bind(&note.path)
        .bind(path_hash(&note.path))
        .bind(&hash)
        .bind(&hash)
        .bind(note.version)
        .bind(&note.client_name)
        .bind(note.content.len() as i64)
        .bind(note.ctime)
        .bind(note.mtime)
        .bind(now_millis())
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        // New notes start with their own content as the diff base
        let folder = self.folder(uid, created.id);
        self.store.save(&folder, CONTENT_FILE, &note.content).await?;
        self.store.save(&folder, SNAPSHOT_FILE, &note.content).await?;

        tx.commit().await?;

        created.content = note.content.clone();
        created.content_last_snapshot = note.content;

        tracing::debug!("Created note {} for user {}", created.id, uid);
        Ok(created)
    }

    async fn update(&self, uid: i64, id: i64, update: NoteUpdate) -> Result<Note> {
        let pool = self.pool(uid).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE note SET updated_at = ");
        qb.push_bind(Utc::now());
        qb.push(", updated_timestamp = ").push_bind(now_millis());

        if let Some(fid) = update.fid {
            qb.push(", fid = ").push_bind(fid);
        }
        if let Some(action) = update.action {
            qb.push(", action = ").push_bind(action);
        }
        if let Some(rename) = update.rename {
            qb.push(", rename = ").push_bind(rename);
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
        if let Some(version) = update.version {
            qb.push(", version = ").push_bind(version);
        }
        if let Some(client_name) = update.client_name {
            qb.push(", client_name = ").push_bind(client_name);
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

        let note = qb
            .build_query_as::<Note>()
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::not_found("note", id))?;

        if let Some(content) = &update.content {
            self.store
                .save(&self.folder(uid, id), CONTENT_FILE, content)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!("Updated note {} for user {}", id, uid);
        self.fill(uid, note).await
    }

    async fn update_timestamp_only(&self, uid: i64, id: i64, updated_timestamp: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        if touch_timestamp(&pool, "note", id, updated_timestamp).await? == 0 {
            return Err(EngineError::not_found("note", id));
        }
        Ok(())
    }

    async fn delete(&self, uid: i64, id: i64) -> Result<()> {
        let pool = self.pool(uid).await?;

        let rows = sqlx::query("DELETE FROM note WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("note", id));
        }

        self.store.remove_folder(&self.folder(uid, id)).await?;

        tracing::debug!("Hard deleted note {} for user {}", id, uid);
        Ok(())
    }

    async fn list_by_updated_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Note>> {
        let pool = self.pool(uid).await?;
        let notes = fetch_updated_since::<Note>(&pool, "note", vault_id, since).await?;
        self.fill_all(uid, notes).await
    }

    async fn list_paged(&self, uid: i64, query: &ListQuery) -> Result<Page<Note>> {
        let pool = self.pool(uid).await?;
        fetch_page::<Note>(&pool, "note", query).await
    }

    async fn update_snapshot(&self, uid: i64, id: i64, snapshot: &str) -> Result<()> {
        let pool = self.pool(uid).await?;
        let mut tx = pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE note
            SET content_last_snapshot = '', content_last_snapshot_hash = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(content_hash(snapshot))
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(EngineError::not_found("note", id));
        }

        self.store
            .save(&self.folder(uid, id), SNAPSHOT_FILE, snapshot)
            .await?;

        tx.commit().await?;

        tracing::debug!("Updated snapshot of note {} for user {}", id, uid);
        Ok(())
    }

    async fn list_by_content_unchanged(&self, uid: i64, updated_before: i64) -> Result<Vec<Note>> {
        let pool = self.pool(uid).await?;

        let notes = sqlx::query_as::<_, Note>(
            r#"
            SELECT * FROM note
            WHERE action != 'delete'
              AND content_hash != content_last_snapshot_hash
              AND updated_timestamp <= ?
            ORDER BY id ASC
            "#,
        )
        .bind(updated_before)
        .fetch_all(&pool)
        .await?;

        self.fill_all(uid, notes).await
    }

    async fn list_live(&self, uid: i64) -> Result<Vec<Note>> {
        let pool = self.pool(uid).await?;

        let notes = sqlx::query_as::<_, Note>(
            "SELECT * FROM note WHERE action != 'delete' ORDER BY id ASC",
        )
        .fetch_all(&pool)
        .await?;

        self.fill_all(uid, notes).await
    }

    async fn count_size_sum(&self, uid: i64, vault_id: i64) -> Result<(i64, i64)> {
        let pool = self.pool(uid).await?;

        let totals: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM note WHERE vault_id = ? AND action != 'delete'",
        )
        .bind(vault_id)
        .fetch_one(&pool)
        .await?;

        Ok(totals)
    }

    async fn delete_physical_by_time(&self, uid: i64, cutoff: i64) -> Result<Vec<i64>> {
        let pool = self.pool(uid).await?;
        let ids = purge_deleted_before(&pool, "note", cutoff).await?;

        for id in &ids {
            if let Err(e) = self.store.remove_folder(&self.folder(uid, *id)).await {
                tracing::warn!("Failed to remove folder of purged note {}: {}", id, e);
            }
        }

        if !ids.is_empty() {
            tracing::info!("Purged {} deleted notes for user {}", ids.len(), uid);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repository::test_support::create_test_space;
    use crate::database::models::{SortField, SortOrder};

    fn new_note(path: &str, content: &str) -> NewNote {
        NewNote {
            vault_id: 1,
            path: path.to_string(),
            content: content.to_string(),
            client_name: "test".to_string(),
            ctime: 1_000,
            mtime: 1_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get_note() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store.clone());

        let note = repo.create(1, new_note("a.md", "hello")).await.unwrap();
        assert_eq!(note.version, 0);
        assert_eq!(note.action, EntityAction::Create);
        assert_eq!(note.content_hash, content_hash("hello"));
        assert_eq!(note.content_last_snapshot_hash, note.content_hash);
        assert_eq!(note.size, 5);

        let fetched = repo.get_by_id(1, note.id).await.unwrap();
        assert_eq!(fetched.content, "hello");
        assert_eq!(fetched.content_last_snapshot, "hello");

        // Row keeps no inline body
        let pool = repo.pool(1).await.unwrap();
        let inline: String = sqlx::query_scalar("SELECT content FROM note WHERE id = ?")
            .bind(note.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(inline, "");

        let by_hash = repo
            .get_by_path_hash(1, 1, &path_hash("a.md"))
            .await
            .unwrap();
        assert_eq!(by_hash.id, note.id);
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_fields() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store);
        let note = repo.create(1, new_note("a.md", "hello")).await.unwrap();

        let updated = repo
            .update(
                1,
                note.id,
                NoteUpdate {
                    content: Some("hello world".to_string()),
                    version: Some(1),
                    action: Some(EntityAction::Modify),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.content, "hello world");
        assert_eq!(updated.content_hash, content_hash("hello world"));
        assert_eq!(updated.size, 11);
        assert_eq!(updated.version, 1);
        assert_eq!(updated.path, "a.md");
        assert_eq!(updated.client_name, "test");
        // Snapshot untouched until explicitly updated
        assert_eq!(updated.content_last_snapshot, "hello");
        assert!(updated.updated_timestamp >= note.updated_timestamp);
    }

    #[tokio::test]
    async fn test_get_by_path_hash_excludes_deleted() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store);
        let note = repo.create(1, new_note("gone.md", "x")).await.unwrap();

        repo.update(
            1,
            note.id,
            NoteUpdate {
                action: Some(EntityAction::Delete),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let hash = path_hash("gone.md");
        assert!(repo.get_by_path_hash(1, 1, &hash).await.unwrap_err().is_not_found());

        let any = repo.find_by_path_hash_any(1, 1, &hash).await.unwrap().unwrap();
        assert_eq!(any.id, note.id);
        assert_eq!(any.action, EntityAction::Delete);
    }

    #[tokio::test]
    async fn test_lazy_migration_of_inline_content() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store.clone());
        let pool = repo.pool(1).await.unwrap();

        // Legacy row with the body inline and no content store files
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO note (vault_id, path, path_hash, content, content_hash, created_at, updated_at)
            VALUES (1, 'legacy.md', ?, 'old body', ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(path_hash("legacy.md"))
        .bind(content_hash("old body"))
        .bind(Utc::now())
        .bind(Utc::now())
        .fetch_one(&pool)
        .await
        .unwrap();

        let folder = store.folder(1, ContentKind::Note, id);
        assert!(!folder.join(CONTENT_FILE).exists());

        let first = repo.get_by_id(1, id).await.unwrap();
        assert_eq!(first.content, "old body");
        assert_eq!(
            store.load(&folder, CONTENT_FILE).await.unwrap(),
            ("old body".to_string(), true)
        );

        let second = repo.get_by_id(1, id).await.unwrap();
        assert_eq!(second.content, "old body");
    }

    #[tokio::test]
    async fn test_snapshot_and_unchanged_listing() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store);
        let note = repo.create(1, new_note("a.md", "v0")).await.unwrap();

        assert!(repo.list_by_content_unchanged(1, i64::MAX).await.unwrap().is_empty());

        repo.update(
            1,
            note.id,
            NoteUpdate {
                content: Some("v1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let pending = repo.list_by_content_unchanged(1, i64::MAX).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "v1");
        assert_eq!(pending[0].content_last_snapshot, "v0");

        // Not old enough yet
        assert!(repo.list_by_content_unchanged(1, 0).await.unwrap().is_empty());

        repo.update_snapshot(1, note.id, "v1").await.unwrap();
        assert!(repo.list_by_content_unchanged(1, i64::MAX).await.unwrap().is_empty());
        assert_eq!(
            repo.get_by_id(1, note.id).await.unwrap().content_last_snapshot,
            "v1"
        );
    }

    #[tokio::test]
    async fn test_list_paged_sort_and_filter() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store);

        for (i, path) in ["b.md", "dir/a.md", "c.md"].iter().enumerate() {
            let mut req = new_note(path, "x");
            req.mtime = i as i64;
            repo.create(1, req).await.unwrap();
        }

        let mut query = ListQuery::for_vault(1);
        let page = repo.list_paged(1, &query).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].path, "c.md");

        query.sort = SortField::Path;
        query.order = SortOrder::Asc;
        query.page_size = 2;
        let page = repo.list_paged(1, &query).await.unwrap();
        let paths: Vec<_> = page.items.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "c.md"]);

        query.page = 2;
        let page = repo.list_paged(1, &query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].path, "dir/a.md");

        let mut prefixed = ListQuery::for_vault(1);
        prefixed.path_prefix = Some("dir/".to_string());
        assert_eq!(repo.list_paged(1, &prefixed).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_updated_since_and_counts() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store);

        let a = repo.create(1, new_note("a.md", "12345")).await.unwrap();
        let b = repo.create(1, new_note("b.md", "123")).await.unwrap();

        let since = repo.list_by_updated_since(1, 1, 0).await.unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].content, "12345");

        assert_eq!(repo.count_size_sum(1, 1).await.unwrap(), (2, 8));

        repo.update_timestamp_only(1, a.id, b.updated_timestamp + 10)
            .await
            .unwrap();
        let since = repo
            .list_by_updated_since(1, 1, b.updated_timestamp)
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, a.id);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let (router, store, _temp) = create_test_space().await;
        let repo = NoteRepository::new(router, store.clone());

        let keep = repo.create(1, new_note("keep.md", "k")).await.unwrap();
        let gone = repo.create(1, new_note("gone.md", "g")).await.unwrap();
        repo.update(
            1,
            gone.id,
            NoteUpdate {
                action: Some(EntityAction::Delete),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let purged = repo.delete_physical_by_time(1, i64::MAX).await.unwrap();
        assert_eq!(purged, vec![gone.id]);
        assert!(!store.folder(1, ContentKind::Note, gone.id).exists());
        assert!(repo.get_by_id(1, gone.id).await.unwrap_err().is_not_found());

        repo.delete(1, keep.id).await.unwrap();
        assert!(!store.folder(1, ContentKind::Note, keep.id).exists());
        assert!(repo.delete(1, keep.id).await.unwrap_err().is_not_found());
    }
}
