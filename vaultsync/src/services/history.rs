//! Note history service
//!
//! Turns committed content changes into immutable history entries. The
//! interactive write path only records content; the snapshot step (diff
//! against the last snapshot, append history, advance the snapshot) runs
//! after a debounce delay through the write serializer, with a periodic
//! sweep as backstop. Pruning applies the time cutoff and keep floor.

use crate::config::EngineConfig;
use crate::database::models::{EntityAction, NewNoteHistory, NoteHistory, Page};
use crate::database::repository::{
    now_millis, NoteHistoryQueries, NoteHistoryRepository, NoteQueries, NoteRepository,
};
use crate::database::SpaceRouter;
use crate::error::Result;
use crate::serializer::WriteSerializer;
use crate::versioning::compute_patch;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

struct PendingSnapshot {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct HistoryService {
    router: Arc<SpaceRouter>,
    notes: NoteRepository,
    history: NoteHistoryRepository,
    serializer: WriteSerializer,
    config: Arc<EngineConfig>,
    timers: Arc<Mutex<HashMap<(i64, i64), PendingSnapshot>>>,
    generation: Arc<AtomicU64>,
}

impl HistoryService {
    pub fn new(
        router: Arc<SpaceRouter>,
        notes: NoteRepository,
        history: NoteHistoryRepository,
        serializer: WriteSerializer,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            router,
            notes,
            history,
            serializer,
            config,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot step for one note, run by the caller's serialized section.
    ///
    /// Returns `None` when the note is deleted or already snapshotted.
    pub(crate) async fn snapshot_in_place(&self, uid: i64, note_id: i64) -> Result<Option<NoteHistory>> {
        let note = self.notes.get_by_id(uid, note_id).await?;

        if note.action == EntityAction::Delete
            || note.content_hash == note.content_last_snapshot_hash
        {
            return Ok(None);
        }

        let patch = compute_patch(&note.content_last_snapshot, &note.content);

        let entry = self
            .history
            .create(
                uid,
                NewNoteHistory {
                    note_id: note.id,
                    vault_id: note.vault_id,
                    path: note.path.clone(),
                    diffs: patch.to_json()?,
                    content: note.content.clone(),
                    client_name: note.client_name.clone(),
                    version: note.version,
                },
            )
            .await?;

        self.notes.update_snapshot(uid, note.id, &note.content).await?;

        tracing::debug!(
            "Snapshotted note {} at version {} for user {}",
            note.id,
            note.version,
            uid
        );
        Ok(Some(entry))
    }

    /// Snapshot one note through the write serializer.
    pub async fn snapshot_note(&self, uid: i64, note_id: i64) -> Result<Option<NoteHistory>> {
        let this = self.clone();
        self.serializer
            .execute(uid, move || async move { this.snapshot_in_place(uid, note_id).await })
            .await
    }

    /// Hook for content-changing writes, called inside their serialized section.
    pub(crate) async fn after_content_change(&self, uid: i64, note_id: i64) {
        if self.config.history_delay_secs == 0 {
            if let Err(e) = self.snapshot_in_place(uid, note_id).await {
                tracing::warn!("Inline snapshot of note {} for user {} failed: {}", note_id, uid, e);
            }
            return;
        }

        self.schedule_snapshot(uid, note_id);
    }

    /// (Re)arm the debounce timer of a note.
    pub fn schedule_snapshot(&self, uid: i64, note_id: i64) {
        let delay = self.config.history_delay();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.forget_timer(uid, note_id, generation);

            if let Err(e) = this.snapshot_note(uid, note_id).await {
                tracing::warn!("Delayed snapshot of note {} for user {} failed: {}", note_id, uid, e);
            }
        });

        if let Ok(mut timers) = self.timers.lock() {
            if let Some(previous) = timers.insert((uid, note_id), PendingSnapshot { generation, handle }) {
                previous.handle.abort();
            }
        }
    }

    fn forget_timer(&self, uid: i64, note_id: i64, generation: u64) {
        if let Ok(mut timers) = self.timers.lock() {
            if timers
                .get(&(uid, note_id))
                .is_some_and(|pending| pending.generation == generation)
            {
                timers.remove(&(uid, note_id));
            }
        }
    }

    /// Drop the pending timer of one note.
    pub(crate) fn cancel(&self, uid: i64, note_id: i64) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(pending) = timers.remove(&(uid, note_id)) {
                pending.handle.abort();
            }
        }
    }

    /// Abort every pending timer; the sweep picks those notes up later.
    pub fn cancel_pending(&self) -> usize {
        let pending: Vec<PendingSnapshot> = match self.timers.lock() {
            Ok(mut timers) => timers.drain().map(|(_, pending)| pending).collect(),
            Err(_) => Vec::new(),
        };

        for timer in &pending {
            timer.handle.abort();
        }

        if !pending.is_empty() {
            tracing::info!("Cancelled {} pending snapshots", pending.len());
        }
        pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.timers.lock().map(|timers| timers.len()).unwrap_or(0)
    }

    /// Snapshot every note of a user whose last write is older than the delay.
    pub async fn snapshot_pending(&self, uid: i64) -> Result<usize> {
        let delay_ms = i64::try_from(self.config.history_delay().as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(delay_ms);
        let notes = self.notes.list_by_content_unchanged(uid, cutoff).await?;

        let mut created = 0;
        for note in notes {
            match self.snapshot_note(uid, note.id).await {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    "Snapshot sweep failed for note {} of user {}: {}",
                    note.id,
                    uid,
                    e
                ),
            }
        }

        Ok(created)
    }

    /// `snapshot_pending` for every registered user.
    pub async fn sweep_pending(&self) -> Result<usize> {
        let mut created = 0;
        for uid in self.router.all_uids().await? {
            match self.snapshot_pending(uid).await {
                Ok(count) => created += count,
                Err(e) => tracing::warn!("Snapshot sweep failed for user {}: {}", uid, e),
            }
        }

        if created > 0 {
            tracing::info!("Snapshot sweep created {} history entries", created);
        }
        Ok(created)
    }

    /// Retention cutoff, `None` when pruning is disabled.
    fn prune_cutoff(&self) -> Option<DateTime<Utc>> {
        if self.config.history_retention_days == 0 {
            return None;
        }
        Some(Utc::now() - ChronoDuration::days(i64::from(self.config.history_retention_days)))
    }

    /// Prune one note's history; returns the deleted versions.
    pub async fn prune_note(&self, uid: i64, note_id: i64) -> Result<Vec<i64>> {
        let Some(cutoff) = self.prune_cutoff() else {
            return Ok(Vec::new());
        };

        let history = self.history.clone();
        let keep = self.config.history_keep_versions;
        self.serializer
            .execute(uid, move || async move {
                history.delete_old_versions(uid, note_id, cutoff, keep).await
            })
            .await
    }

    /// Prune every note of every user, continuing past failures.
    pub async fn prune_all(&self) -> Result<usize> {
        let Some(cutoff) = self.prune_cutoff() else {
            return Ok(0);
        };

        let mut pruned = 0;
        for uid in self.router.all_uids().await? {
            let note_ids = match self.history.note_ids_with_old_history(uid, cutoff).await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!("History prune skipped user {}: {}", uid, e);
                    continue;
                }
            };

            for note_id in note_ids {
                match self.prune_note(uid, note_id).await {
                    Ok(versions) => pruned += versions.len(),
                    Err(e) => tracing::warn!(
                        "History prune failed for note {} of user {}: {}",
                        note_id,
                        uid,
                        e
                    ),
                }
            }
        }

        if pruned > 0 {
            tracing::info!("Pruned {} history entries", pruned);
        }
        Ok(pruned)
    }

    /// Page of a note's history, newest first
    pub async fn list(&self, uid: i64, note_id: i64, page: u32, page_size: u32) -> Result<Page<NoteHistory>> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, crate::config::MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(page_size);

        let items = self
            .history
            .list_by_note(uid, note_id, page_size, offset)
            .await?;
        let total = self.history.count_by_note(uid, note_id).await?;

        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn get_version(&self, uid: i64, note_id: i64, version: i64) -> Result<NoteHistory> {
        self.history.get_by_version(uid, note_id, version).await
    }

    /// Drop all history of a purged note. Runs inside the caller's serialized section.
    pub(crate) async fn delete_for_note(&self, uid: i64, note_id: i64) -> Result<usize> {
        self.cancel(uid, note_id);
        self.history.delete_by_note(uid, note_id).await
    }

    /// Hand a note's history to the row that replaced it. Runs inside the caller's serialized section.
    pub(crate) async fn move_to(&self, uid: i64, from_note_id: i64, to_note_id: i64) -> Result<u64> {
        self.cancel(uid, from_note_id);
        let moved = self.history.reassign_note(uid, from_note_id, to_note_id).await?;
        if moved > 0 {
            tracing::debug!(
                "Moved {} history entries from note {} to {} for user {}",
                moved,
                from_note_id,
                to_note_id,
                uid
            );
        }
        Ok(moved)
    }

    /// Recorded content of a note matching `content_hash`, if any entry has it
    pub(crate) async fn content_by_hash(
        &self,
        uid: i64,
        note_id: i64,
        content_hash: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .history
            .find_by_content_hash(uid, note_id, content_hash)
            .await?
            .map(|entry| entry.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{NewNote, NoteUpdate};
    use crate::database::repository::test_support::create_test_space;
    use crate::database::repository::UserRepository;
    use crate::versioning::{apply_patch, Patch};
    use std::time::Duration;

    async fn create_test_service(
        history_delay_secs: u64,
    ) -> (HistoryService, NoteRepository, tempfile::TempDir) {
        let (router, store, temp) = create_test_space().await;
        let config = Arc::new(EngineConfig {
            history_delay_secs,
            ..EngineConfig::rooted_at(temp.path())
        });
        let notes = NoteRepository::new(Arc::clone(&router), store.clone());
        let service = HistoryService::new(
            Arc::clone(&router),
            notes.clone(),
            NoteHistoryRepository::new(router, store),
            WriteSerializer::new(&config),
            config,
        );
        (service, notes, temp)
    }

    async fn edit(notes: &NoteRepository, id: i64, content: &str, version: i64) {
        notes
            .update(
                1,
                id,
                NoteUpdate {
                    content: Some(content.to_string()),
                    version: Some(version),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_records_patch_and_content() {
        let (service, notes, _temp) = create_test_service(0).await;
        let note = notes
            .create(
                1,
                NewNote {
                    vault_id: 1,
                    path: "a.md".to_string(),
                    content: "hello".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Fresh notes have nothing to snapshot
        assert!(service.snapshot_note(1, note.id).await.unwrap().is_none());

        edit(&notes, note.id, "hello world", 1).await;
        let entry = service.snapshot_note(1, note.id).await.unwrap().unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.content, "hello world");

        let patch = Patch::from_json(&entry.diffs).unwrap();
        assert_eq!(apply_patch("hello", &patch).unwrap(), "hello world");

        // Snapshot advanced, so a second run is a no-op
        assert!(service.snapshot_note(1, note.id).await.unwrap().is_none());
        let stored = notes.get_by_id(1, note.id).await.unwrap();
        assert_eq!(stored.content_last_snapshot, "hello world");

        let page = service.list(1, note.id, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(service.get_version(1, note.id, 1).await.unwrap().content, "hello world");
    }

    #[tokio::test]
    async fn test_debounced_snapshot_batches_edits() {
        let (service, notes, _temp) = create_test_service(1).await;
        let note = notes
            .create(
                1,
                NewNote {
                    vault_id: 1,
                    path: "b.md".to_string(),
                    content: "v0".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for (version, content) in [(1, "v1"), (2, "v2"), (3, "v3")] {
            edit(&notes, note.id, content, version).await;
            service.after_content_change(1, note.id).await;
        }
        assert_eq!(service.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let page = service.list(1, note.id, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].version, 3);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_snapshots_registered_users() {
        let (service, notes, _temp) = create_test_service(0).await;
        let users = UserRepository::new(service.router.registry().clone());
        let user = users.create("alice").await.unwrap();

        let note = notes
            .create(
                user.uid,
                NewNote {
                    vault_id: 1,
                    path: "c.md".to_string(),
                    content: "first".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        notes
            .update(
                user.uid,
                note.id,
                NoteUpdate {
                    content: Some("second".to_string()),
                    version: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(service.sweep_pending().await.unwrap(), 1);
        assert_eq!(service.sweep_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let (service, _notes, _temp) = create_test_service(60).await;
        service.schedule_snapshot(1, 10);
        service.schedule_snapshot(1, 11);
        service.schedule_snapshot(1, 10);

        assert_eq!(service.pending_count(), 2);
        assert_eq!(service.cancel_pending(), 2);
        assert_eq!(service.pending_count(), 0);
    }
}
