//! Notes service
//!
//! Note lifecycle for sync clients. Every mutation runs in the owner's
//! write lane and, within it, keeps the derived state in step: parent
//! folders, the search index, wiki links, vault counters and history.

use super::history::HistoryService;
use super::links::{link_targets, LinkParser};
use super::vaults::VaultService;
use crate::database::models::{
    EntityAction, FolderUpdate, ListQuery, NewFolder, NewNote, Note, NoteHistory, NoteLink,
    NoteUpdate, Page,
};
use crate::database::repository::{
    now_millis, FolderQueries, FolderRepository, NoteLinkQueries, NoteLinkRepository, NoteQueries,
    NoteRepository,
};
use crate::error::{EngineError, Result};
use crate::search::{FtsIndex, SearchHit};
use crate::serializer::WriteSerializer;
use crate::versioning::{content_hash, merge_texts, path_hash};
use chrono::Utc;

/// Client push of one note
#[derive(Debug, Clone, Default)]
pub struct NoteWrite {
    pub path: String,
    pub content: String,
    pub client_name: String,
    pub ctime: i64,
    pub mtime: i64,
}

/// Result of a save made against a known base version
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// No concurrent change; the write was applied as sent
    Saved(Note),
    /// Both sides changed since the base and the edits were combined
    Merged(Note),
    /// Edits collided; the note is untouched and the client's text went to `copy`
    Conflict { current: Note, copy: Note },
}

impl SaveOutcome {
    /// The note now stored at the written path
    pub fn note(&self) -> &Note {
        match self {
            SaveOutcome::Saved(note) | SaveOutcome::Merged(note) => note,
            SaveOutcome::Conflict { current, .. } => current,
        }
    }
}

/// What a client holding some content of a path needs to do
#[derive(Debug, Clone)]
pub enum UpdateCheck {
    /// Nothing live on the server, push it
    Create,
    /// Content differs
    UpdateContent(Note),
    /// Same content, the server's mtime is newer
    UpdateMtime(Note),
    InSync(Note),
}

/// Service for managing notes
#[derive(Clone)]
pub struct NoteService {
    notes: NoteRepository,
    links: NoteLinkRepository,
    folders: FolderRepository,
    history: HistoryService,
    vaults: VaultService,
    fts: FtsIndex,
    serializer: WriteSerializer,
    parser: LinkParser,
}

fn normalize_path(path: &str) -> Result<String> {
    let path = path.trim().trim_matches('/').to_string();
    if path.is_empty() {
        return Err(EngineError::InvalidInput("note path is empty".to_string()));
    }
    Ok(path)
}

/// `notes/a.md` becomes `notes/a.conflict.<stamp>.md`
fn conflict_path(path: &str, stamp: &str) -> String {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let split = name_start + dot;
            format!("{}.conflict.{}{}", &path[..split], stamp, &path[split..])
        }
        _ => format!("{}.conflict.{}", path, stamp),
    }
}

impl NoteService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        notes: NoteRepository,
        links: NoteLinkRepository,
        folders: FolderRepository,
        history: HistoryService,
        vaults: VaultService,
        fts: FtsIndex,
        serializer: WriteSerializer,
    ) -> Result<Self> {
        Ok(Self {
            notes,
            links,
            folders,
            history,
            vaults,
            fts,
            serializer,
            parser: LinkParser::new()?,
        })
    }

    /// Create or update the note at `write.path`.
    ///
    /// Unchanged content only refreshes client metadata and keeps the
    /// version. Writing over a deleted note revives it.
    pub async fn save(&self, uid: i64, vault_id: i64, write: NoteWrite) -> Result<Note> {
        let path = normalize_path(&write.path)?;
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;
                let write = NoteWrite { path, ..write };
                let note = this.save_in_lane(uid, vault_id, write).await?;
                this.vaults.refresh_note_stats(uid, vault_id).await?;
                Ok(note)
            })
            .await
    }

    async fn save_in_lane(&self, uid: i64, vault_id: i64, write: NoteWrite) -> Result<Note> {
        let ph = path_hash(&write.path);
        let existing = self.notes.find_by_path_hash_any(uid, vault_id, &ph).await?;

        let Some(current) = existing else {
            let fid = self.ensure_folders(uid, vault_id, &write.path).await?;
            let note = self
                .notes
                .create(
                    uid,
                    NewNote {
                        vault_id,
                        fid,
                        path: write.path,
                        content: write.content,
                        version: 0,
                        client_name: write.client_name,
                        ctime: write.ctime,
                        mtime: write.mtime,
                    },
                )
                .await?;

            self.index_note(uid, &note).await;
            tracing::info!("Created note {} ({}) for user {}", note.id, note.path, uid);
            return Ok(note);
        };

        let was_deleted = current.action == EntityAction::Delete;
        let fid = if was_deleted {
            Some(self.ensure_folders(uid, vault_id, &write.path).await?)
        } else {
            None
        };

        if content_hash(&write.content) == current.content_hash {
            let mut update = NoteUpdate {
                client_name: Some(write.client_name),
                mtime: Some(write.mtime),
                ..Default::default()
            };
            if was_deleted {
                update.fid = fid;
                update.action = Some(EntityAction::Modify);
                update.rename = Some(false);
            }

            let note = self.notes.update(uid, current.id, update).await?;
            if was_deleted {
                self.index_note(uid, &note).await;
                tracing::info!("Revived note {} for user {}", note.id, uid);
            }
            return Ok(note);
        }

        let note = self
            .notes
            .update(
                uid,
                current.id,
                NoteUpdate {
                    fid,
                    action: Some(EntityAction::Modify),
                    rename: Some(false),
                    content: Some(write.content),
                    version: Some(current.version + 1),
                    client_name: Some(write.client_name),
                    mtime: Some(write.mtime),
                    ..Default::default()
                },
            )
            .await?;

        self.index_note(uid, &note).await;
        self.history.after_content_change(uid, note.id).await;

        tracing::debug!(
            "Saved note {} at version {} for user {}",
            note.id,
            note.version,
            uid
        );
        Ok(note)
    }

    /// Move a note. The old row is marked deleted with the rename flag; the
    /// new row carries content and version forward.
    pub async fn rename(
        &self,
        uid: i64,
        vault_id: i64,
        old_path: &str,
        new_path: &str,
        client_name: &str,
    ) -> Result<Note> {
        let old_path = normalize_path(old_path)?;
        let new_path = normalize_path(new_path)?;
        let client_name = client_name.to_string();
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;

                let old = this
                    .notes
                    .get_by_path_hash(uid, vault_id, &path_hash(&old_path))
                    .await?;
                if old_path == new_path {
                    return Ok(old);
                }

                let target_hash = path_hash(&new_path);
                match this.notes.get_by_path_hash(uid, vault_id, &target_hash).await {
                    Ok(_) => {
                        return Err(EngineError::InvalidInput(format!(
                            "note already exists at {}",
                            new_path
                        )))
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }

                // Pending edits are recorded before the history changes hands
                this.history.snapshot_in_place(uid, old.id).await?;

                let fid = this.ensure_folders(uid, vault_id, &new_path).await?;
                let renamed = this
                    .notes
                    .create(
                        uid,
                        NewNote {
                            vault_id,
                            fid,
                            path: new_path,
                            content: old.content.clone(),
                            version: old.version,
                            client_name: client_name.clone(),
                            ctime: old.ctime,
                            mtime: now_millis(),
                        },
                    )
                    .await?;

                this.notes
                    .update(
                        uid,
                        old.id,
                        NoteUpdate {
                            action: Some(EntityAction::Delete),
                            rename: Some(true),
                            client_name: Some(client_name),
                            ..Default::default()
                        },
                    )
                    .await?;

                this.history.move_to(uid, old.id, renamed.id).await?;
                this.unindex_note(uid, old.id).await;
                this.index_note(uid, &renamed).await;
                this.vaults.refresh_note_stats(uid, vault_id).await?;

                tracing::info!(
                    "Renamed note {} ({}) to {} ({}) for user {}",
                    old.id,
                    old.path,
                    renamed.id,
                    renamed.path,
                    uid
                );
                Ok(renamed)
            })
            .await
    }

    /// Soft delete
    pub async fn delete(&self, uid: i64, vault_id: i64, path: &str) -> Result<Note> {
        let path = normalize_path(path)?;
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;

                let current = this
                    .notes
                    .get_by_path_hash(uid, vault_id, &path_hash(&path))
                    .await?;

                let note = this
                    .notes
                    .update(
                        uid,
                        current.id,
                        NoteUpdate {
                            action: Some(EntityAction::Delete),
                            rename: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;

                this.history.cancel(uid, note.id);
                this.unindex_note(uid, note.id).await;
                this.vaults.refresh_note_stats(uid, vault_id).await?;

                tracing::info!("Deleted note {} for user {}", note.id, uid);
                Ok(note)
            })
            .await
    }

    /// Undo a soft delete. The version is left as it was.
    pub async fn restore(&self, uid: i64, vault_id: i64, path: &str) -> Result<Note> {
        let path = normalize_path(path)?;
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;

                let current = this
                    .notes
                    .find_by_path_hash_any(uid, vault_id, &path_hash(&path))
                    .await?
                    .ok_or_else(|| EngineError::not_found("note", &path))?;

                if current.action != EntityAction::Delete {
                    return Ok(current);
                }

                let fid = this.ensure_folders(uid, vault_id, &path).await?;
                let note = this
                    .notes
                    .update(
                        uid,
                        current.id,
                        NoteUpdate {
                            fid: Some(fid),
                            action: Some(EntityAction::Modify),
                            rename: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;

                this.index_note(uid, &note).await;
                this.vaults.refresh_note_stats(uid, vault_id).await?;

                tracing::info!("Restored note {} for user {}", note.id, uid);
                Ok(note)
            })
            .await
    }

    /// Save `write` made on top of the content hashing to `base_hash`.
    ///
    /// When the server moved on since that base, the two edits are merged;
    /// if they collide, or the base is unknown, the note is left alone and
    /// the client's text is stored as a conflict copy next to it.
    pub async fn save_with_base(
        &self,
        uid: i64,
        vault_id: i64,
        write: NoteWrite,
        base_hash: &str,
    ) -> Result<SaveOutcome> {
        let path = normalize_path(&write.path)?;
        let base_hash = base_hash.to_string();
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;
                let write = NoteWrite { path, ..write };
                let outcome = this.save_against_base(uid, vault_id, write, &base_hash).await?;
                this.vaults.refresh_note_stats(uid, vault_id).await?;
                Ok(outcome)
            })
            .await
    }

    async fn save_against_base(
        &self,
        uid: i64,
        vault_id: i64,
        write: NoteWrite,
        base_hash: &str,
    ) -> Result<SaveOutcome> {
        let current = match self
            .notes
            .find_by_path_hash_any(uid, vault_id, &path_hash(&write.path))
            .await?
        {
            Some(note) if note.action != EntityAction::Delete => note,
            _ => return Ok(SaveOutcome::Saved(self.save_in_lane(uid, vault_id, write).await?)),
        };

        if current.content_hash == base_hash || current.content_hash == content_hash(&write.content) {
            return Ok(SaveOutcome::Saved(self.save_in_lane(uid, vault_id, write).await?));
        }

        let base = self.base_content(uid, &current, base_hash).await?;
        let merged = base
            .as_deref()
            .and_then(|base| merge_texts(base, &current.content, &write.content));

        if let Some(merged) = merged {
            let note = self
                .save_in_lane(uid, vault_id, NoteWrite { content: merged, ..write })
                .await?;
            tracing::info!("Merged concurrent edits of note {} for user {}", note.id, uid);
            return Ok(SaveOutcome::Merged(note));
        }

        let copy = self.conflict_copy_in_lane(uid, vault_id, write).await?;
        Ok(SaveOutcome::Conflict { current, copy })
    }

    /// Content of `note` as it was when it hashed to `base_hash`
    async fn base_content(&self, uid: i64, note: &Note, base_hash: &str) -> Result<Option<String>> {
        if base_hash.is_empty() {
            return Ok(None);
        }
        if note.content_last_snapshot_hash == base_hash {
            return Ok(Some(note.content_last_snapshot.clone()));
        }
        self.history.content_by_hash(uid, note.id, base_hash).await
    }

    /// Store `write` as `<name>.conflict.<timestamp><ext>` beside `write.path`.
    pub async fn create_conflict_copy(&self, uid: i64, vault_id: i64, write: NoteWrite) -> Result<Note> {
        let path = normalize_path(&write.path)?;
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;
                let copy = this
                    .conflict_copy_in_lane(uid, vault_id, NoteWrite { path, ..write })
                    .await?;
                this.vaults.refresh_note_stats(uid, vault_id).await?;
                Ok(copy)
            })
            .await
    }

    async fn conflict_copy_in_lane(&self, uid: i64, vault_id: i64, write: NoteWrite) -> Result<Note> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut path = conflict_path(&write.path, &stamp);
        let mut attempt = 1;

        while self
            .notes
            .find_by_path_hash_any(uid, vault_id, &path_hash(&path))
            .await?
            .is_some()
        {
            attempt += 1;
            path = conflict_path(&write.path, &format!("{}-{}", stamp, attempt));
        }

        let original = write.path.clone();
        let copy = self
            .save_in_lane(uid, vault_id, NoteWrite { path, ..write })
            .await?;

        tracing::info!(
            "Stored conflicting edit of {} as {} for user {}",
            original,
            copy.path,
            uid
        );
        Ok(copy)
    }

    /// Compare a client's copy of `path` with the server's.
    ///
    /// A newer client mtime on identical content is adopted by the server.
    pub async fn update_check(
        &self,
        uid: i64,
        vault_id: i64,
        path: &str,
        client_hash: &str,
        mtime: i64,
    ) -> Result<UpdateCheck> {
        let path = normalize_path(path)?;
        let note = match self
            .notes
            .find_by_path_hash_any(uid, vault_id, &path_hash(&path))
            .await?
        {
            Some(note) if note.action != EntityAction::Delete => note,
            _ => return Ok(UpdateCheck::Create),
        };

        if note.content_hash != client_hash {
            return Ok(UpdateCheck::UpdateContent(note));
        }
        if mtime < note.mtime {
            return Ok(UpdateCheck::UpdateMtime(note));
        }
        if mtime > note.mtime {
            let notes = self.notes.clone();
            let id = note.id;
            let updated = self
                .serializer
                .execute(uid, move || async move {
                    notes
                        .update(
                            uid,
                            id,
                            NoteUpdate {
                                mtime: Some(mtime),
                                ..Default::default()
                            },
                        )
                        .await
                })
                .await;

            match updated {
                Ok(updated) => return Ok(UpdateCheck::InSync(updated)),
                Err(e) => tracing::warn!("Failed to adopt mtime of note {} for user {}: {}", id, uid, e),
            }
        }

        Ok(UpdateCheck::InSync(note))
    }

    /// Make a recorded version the current content again.
    ///
    /// The note moves to a new version and the restored text is snapshotted
    /// right away.
    pub async fn restore_version(
        &self,
        uid: i64,
        vault_id: i64,
        note_id: i64,
        version: i64,
        client_name: &str,
    ) -> Result<Note> {
        let client_name = client_name.to_string();
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;

                let current = this.owned_note(uid, vault_id, note_id).await?;
                if current.action == EntityAction::Delete {
                    return Err(EngineError::InvalidInput(format!(
                        "note {} is deleted",
                        note_id
                    )));
                }

                let entry = this.history.get_version(uid, current.id, version).await?;
                if entry.content_hash == current.content_hash {
                    return Ok(current);
                }

                // Unrecorded edits get their own entry first
                this.history.snapshot_in_place(uid, current.id).await?;
                this.history.cancel(uid, current.id);

                let note = this
                    .notes
                    .update(
                        uid,
                        current.id,
                        NoteUpdate {
                            action: Some(EntityAction::Modify),
                            rename: Some(false),
                            content: Some(entry.content),
                            version: Some(current.version + 1),
                            client_name: Some(client_name),
                            mtime: Some(now_millis()),
                            ..Default::default()
                        },
                    )
                    .await?;

                this.index_note(uid, &note).await;
                this.history.snapshot_in_place(uid, note.id).await?;
                this.vaults.refresh_note_stats(uid, vault_id).await?;

                tracing::info!(
                    "Restored note {} to version {} as version {} for user {}",
                    note.id,
                    version,
                    note.version,
                    uid
                );
                Ok(note)
            })
            .await
    }

    /// Hard delete with history, links, index row and content folder.
    pub async fn purge(&self, uid: i64, vault_id: i64, note_id: i64) -> Result<()> {
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                let note = this.owned_note(uid, vault_id, note_id).await?;

                this.drop_derived(uid, note.id).await?;
                this.notes.delete(uid, note.id).await?;
                this.vaults.refresh_note_stats(uid, vault_id).await?;

                tracing::info!("Purged note {} for user {}", note.id, uid);
                Ok(())
            })
            .await
    }

    /// Hard delete notes and folders soft-deleted before `cutoff` (ms).
    pub async fn purge_deleted(&self, uid: i64, cutoff: i64) -> Result<usize> {
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                let ids = this.notes.delete_physical_by_time(uid, cutoff).await?;
                for id in &ids {
                    if let Err(e) = this.drop_derived(uid, *id).await {
                        tracing::warn!("Failed to clean up purged note {} for user {}: {}", id, uid, e);
                    }
                }

                let folders = this.folders.delete_physical_by_time(uid, cutoff).await?;
                Ok(ids.len() + folders.len())
            })
            .await
    }

    pub async fn get(&self, uid: i64, vault_id: i64, note_id: i64) -> Result<Note> {
        self.owned_note(uid, vault_id, note_id).await
    }

    pub async fn get_by_path(&self, uid: i64, vault_id: i64, path: &str) -> Result<Note> {
        let path = normalize_path(path)?;
        self.notes
            .get_by_path_hash(uid, vault_id, &path_hash(&path))
            .await
    }

    /// Incremental pull, deletes included
    pub async fn list_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Note>> {
        self.notes.list_by_updated_since(uid, vault_id, since).await
    }

    pub async fn list(&self, uid: i64, query: &ListQuery) -> Result<Page<Note>> {
        self.notes.list_paged(uid, query).await
    }

    pub async fn search(
        &self,
        uid: i64,
        vault_id: i64,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<SearchHit>> {
        self.fts.search(uid, vault_id, keyword, limit).await
    }

    /// Links pointing at `path`, written as `path` or without `.md`
    pub async fn backlinks(&self, uid: i64, vault_id: i64, path: &str) -> Result<Vec<NoteLink>> {
        let path = normalize_path(path)?;
        let hashes: Vec<String> = link_targets(&path).iter().map(|p| path_hash(p)).collect();
        self.links.backlinks(uid, vault_id, &hashes).await
    }

    pub async fn outlinks(&self, uid: i64, vault_id: i64, note_id: i64) -> Result<Vec<NoteLink>> {
        let note = self.owned_note(uid, vault_id, note_id).await?;
        self.links.outlinks(uid, note.id).await
    }

    pub async fn history(
        &self,
        uid: i64,
        vault_id: i64,
        note_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<Page<NoteHistory>> {
        let note = self.owned_note(uid, vault_id, note_id).await?;
        self.history.list(uid, note.id, page, page_size).await
    }

    pub async fn history_version(
        &self,
        uid: i64,
        vault_id: i64,
        note_id: i64,
        version: i64,
    ) -> Result<NoteHistory> {
        let note = self.owned_note(uid, vault_id, note_id).await?;
        self.history.get_version(uid, note.id, version).await
    }

    async fn owned_note(&self, uid: i64, vault_id: i64, note_id: i64) -> Result<Note> {
        let note = self.notes.get_by_id(uid, note_id).await?;
        if note.vault_id != vault_id {
            return Err(EngineError::OwnershipMismatch(format!(
                "note {} does not belong to vault {}",
                note_id, vault_id
            )));
        }
        Ok(note)
    }

    /// Make sure every ancestor folder of `path` is live; returns the parent id.
    async fn ensure_folders(&self, uid: i64, vault_id: i64, path: &str) -> Result<i64> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut parent = 0;

        for depth in 1..segments.len() {
            let folder_path = segments[..depth].join("/");
            let hash = path_hash(&folder_path);

            parent = match self.folders.find_by_path_hash_any(uid, vault_id, &hash).await? {
                Some(folder) if folder.action != EntityAction::Delete => folder.id,
                Some(folder) => {
                    self.folders
                        .update(
                            uid,
                            folder.id,
                            FolderUpdate {
                                action: Some(EntityAction::Modify),
                                fid: Some(parent),
                                ..Default::default()
                            },
                        )
                        .await?
                        .id
                }
                None => {
                    let now = now_millis();
                    self.folders
                        .create(
                            uid,
                            NewFolder {
                                vault_id,
                                path: folder_path,
                                fid: parent,
                                ctime: now,
                                mtime: now,
                            },
                        )
                        .await?
                        .id
                }
            };
        }

        Ok(parent)
    }

    /// Refresh derived state of a live note. Both are rebuildable, so failures only warn.
    async fn index_note(&self, uid: i64, note: &Note) {
        if let Err(e) = self.fts.upsert(uid, note).await {
            tracing::warn!("Failed to index note {} for user {}: {}", note.id, uid, e);
        }

        let links = self.parser.parse(&note.content);
        if let Err(e) = self
            .links
            .replace_for_source(uid, note.vault_id, note.id, links)
            .await
        {
            tracing::warn!("Failed to store links of note {} for user {}: {}", note.id, uid, e);
        }
    }

    async fn unindex_note(&self, uid: i64, note_id: i64) {
        if let Err(e) = self.fts.remove(uid, note_id).await {
            tracing::warn!("Failed to unindex note {} for user {}: {}", note_id, uid, e);
        }
        if let Err(e) = self.links.delete_by_source(uid, note_id).await {
            tracing::warn!("Failed to drop links of note {} for user {}: {}", note_id, uid, e);
        }
    }

    async fn drop_derived(&self, uid: i64, note_id: i64) -> Result<()> {
        self.history.delete_for_note(uid, note_id).await?;
        self.unindex_note(uid, note_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::database::repository::test_support::create_test_space;
    use crate::database::repository::{
        FileRepository, NoteHistoryRepository, VaultRepository,
    };
    use crate::versioning::{Patch, PatchOp};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_service() -> (NoteService, i64, TempDir) {
        let (router, store, temp) = create_test_space().await;
        let config = Arc::new(EngineConfig {
            history_delay_secs: 0,
            ..EngineConfig::rooted_at(temp.path())
        });
        let serializer = WriteSerializer::new(&config);

        let notes = NoteRepository::new(Arc::clone(&router), store.clone());
        let vaults = VaultService::new(
            VaultRepository::new(Arc::clone(&router)),
            notes.clone(),
            FileRepository::new(Arc::clone(&router), store.clone()),
            serializer.clone(),
        );
        let history = HistoryService::new(
            Arc::clone(&router),
            notes.clone(),
            NoteHistoryRepository::new(Arc::clone(&router), store),
            serializer.clone(),
            config,
        );
        let service = NoteService::new(
            notes.clone(),
            NoteLinkRepository::new(Arc::clone(&router)),
            FolderRepository::new(Arc::clone(&router)),
            history,
            vaults.clone(),
            FtsIndex::new(router, notes),
            serializer,
        )
        .unwrap();

        let vault = vaults.create(1, "Main").await.unwrap();
        (service, vault.id, temp)
    }

    fn write(path: &str, content: &str) -> NoteWrite {
        NoteWrite {
            path: path.to_string(),
            content: content.to_string(),
            client_name: "desktop".to_string(),
            ctime: 1_000,
            mtime: 2_000,
        }
    }

    #[tokio::test]
    async fn test_save_versions_and_history() {
        let (service, vault_id, _temp) = create_test_service().await;

        let created = service.save(1, vault_id, write("a.md", "hello")).await.unwrap();
        assert_eq!(created.version, 0);
        assert_eq!(created.action, EntityAction::Create);

        let updated = service
            .save(1, vault_id, write("a.md", "hello world"))
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.version, 1);
        assert_eq!(updated.action, EntityAction::Modify);

        let page = service.history(1, vault_id, created.id, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        let patch = Patch::from_json(&page.items[0].diffs).unwrap();
        assert_eq!(
            patch.ops,
            vec![
                PatchOp::Equal { len: 5 },
                PatchOp::Insert {
                    text: " world".to_string()
                }
            ]
        );

        // Same content: metadata only
        let mut same = write("a.md", "hello world");
        same.mtime = 3_000;
        let unchanged = service.save(1, vault_id, same).await.unwrap();
        assert_eq!(unchanged.version, 1);
        assert_eq!(unchanged.mtime, 3_000);
        assert_eq!(service.history(1, vault_id, created.id, 1, 10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_save_creates_folder_chain() {
        let (service, vault_id, _temp) = create_test_service().await;

        let note = service
            .save(1, vault_id, write("a/b/c.md", "deep"))
            .await
            .unwrap();

        let parent = service
            .folders
            .get_by_path_hash(1, vault_id, &path_hash("a/b"))
            .await
            .unwrap();
        let root = service
            .folders
            .get_by_path_hash(1, vault_id, &path_hash("a"))
            .await
            .unwrap();
        assert_eq!(note.fid, parent.id);
        assert_eq!(parent.fid, root.id);
        assert_eq!(root.fid, 0);
    }

    #[tokio::test]
    async fn test_rename_carries_version() {
        let (service, vault_id, _temp) = create_test_service().await;

        service.save(1, vault_id, write("old.md", "one")).await.unwrap();
        let edited = service.save(1, vault_id, write("old.md", "two")).await.unwrap();

        let renamed = service
            .rename(1, vault_id, "old.md", "new.md", "laptop")
            .await
            .unwrap();
        assert_ne!(renamed.id, edited.id);
        assert_eq!(renamed.version, edited.version);
        assert_eq!(renamed.content, "two");

        let old = service.get(1, vault_id, edited.id).await.unwrap();
        assert_eq!(old.action, EntityAction::Delete);
        assert!(old.rename);
        assert!(service.get_by_path(1, vault_id, "old.md").await.unwrap_err().is_not_found());

        let hits = service.search(1, vault_id, "two", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note_id, renamed.id);

        // Target taken
        service.save(1, vault_id, write("other.md", "x")).await.unwrap();
        let err = service
            .rename(1, vault_id, "new.md", "other.md", "laptop")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_delete_restore_and_revive() {
        let (service, vault_id, _temp) = create_test_service().await;

        let note = service.save(1, vault_id, write("n.md", "body")).await.unwrap();
        let deleted = service.delete(1, vault_id, "n.md").await.unwrap();
        assert_eq!(deleted.action, EntityAction::Delete);
        assert_eq!(deleted.version, note.version);
        assert!(service.search(1, vault_id, "body", 10).await.unwrap().is_empty());

        let restored = service.restore(1, vault_id, "n.md").await.unwrap();
        assert_eq!(restored.id, note.id);
        assert_eq!(restored.action, EntityAction::Modify);
        assert_eq!(restored.version, note.version);
        assert_eq!(service.search(1, vault_id, "body", 10).await.unwrap().len(), 1);

        service.delete(1, vault_id, "n.md").await.unwrap();
        let revived = service.save(1, vault_id, write("n.md", "body")).await.unwrap();
        assert_eq!(revived.id, note.id);
        assert_eq!(revived.action, EntityAction::Modify);
        assert_eq!(revived.version, note.version);
    }

    #[tokio::test]
    async fn test_links_and_ownership() {
        let (service, vault_id, _temp) = create_test_service().await;

        let target = service.save(1, vault_id, write("target.md", "t")).await.unwrap();
        let source = service
            .save(1, vault_id, write("source.md", "see [[target]] and ![[target.md]]"))
            .await
            .unwrap();

        let backlinks = service.backlinks(1, vault_id, "target.md").await.unwrap();
        assert_eq!(backlinks.len(), 2);
        assert!(backlinks.iter().all(|l| l.source_note_id == source.id));

        let outlinks = service.outlinks(1, vault_id, source.id).await.unwrap();
        assert_eq!(outlinks.len(), 2);

        let err = service.get(1, vault_id + 1, target.id).await.unwrap_err();
        assert!(matches!(err, EngineError::OwnershipMismatch(_)));

        // Editing the links away clears them
        service.save(1, vault_id, write("source.md", "none")).await.unwrap();
        assert!(service.backlinks(1, vault_id, "target.md").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_and_stats() {
        let (service, vault_id, _temp) = create_test_service().await;

        let note = service.save(1, vault_id, write("p.md", "12345")).await.unwrap();
        service.save(1, vault_id, write("p.md", "123456")).await.unwrap();

        let stats = service.vaults.stats(1, vault_id).await.unwrap();
        assert_eq!(stats.note_count, 1);
        assert_eq!(stats.note_size, 6);

        service.purge(1, vault_id, note.id).await.unwrap();
        assert!(service.notes.get_by_id(1, note.id).await.unwrap_err().is_not_found());
        assert_eq!(service.vaults.stats(1, vault_id).await.unwrap().note_count, 0);

        let gone = service.save(1, vault_id, write("q.md", "q")).await.unwrap();
        service.delete(1, vault_id, "q.md").await.unwrap();
        assert_eq!(service.purge_deleted(1, now_millis() + 1).await.unwrap(), 1);
        assert!(service.notes.get_by_id(1, gone.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_writes_into_deleted_vault_fail() {
        let (service, vault_id, _temp) = create_test_service().await;
        service.save(1, vault_id, write("kept.md", "x")).await.unwrap();
        service.save(1, vault_id, write("gone.md", "y")).await.unwrap();
        service.delete(1, vault_id, "gone.md").await.unwrap();
        service.vaults.delete(1, vault_id).await.unwrap();

        let err = service.save(1, vault_id, write("a.md", "x")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(service.save(1, vault_id, write("  ", "x")).await.is_err());

        assert!(service.delete(1, vault_id, "kept.md").await.unwrap_err().is_not_found());
        assert!(service.restore(1, vault_id, "gone.md").await.unwrap_err().is_not_found());
        assert!(service
            .rename(1, vault_id, "kept.md", "moved.md", "desktop")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_history_follows_rename_past_purge() {
        let (service, vault_id, _temp) = create_test_service().await;

        let original = service.save(1, vault_id, write("draft.md", "one")).await.unwrap();
        service.save(1, vault_id, write("draft.md", "two")).await.unwrap();

        let renamed = service
            .rename(1, vault_id, "draft.md", "final.md", "desktop")
            .await
            .unwrap();
        let page = service.history(1, vault_id, renamed.id, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].content, "two");

        // Purging the tombstone leaves the moved history alone
        assert!(service.purge_deleted(1, now_millis() + 1).await.unwrap() >= 1);
        assert!(service.notes.get_by_id(1, original.id).await.unwrap_err().is_not_found());

        let page = service.history(1, vault_id, renamed.id, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);

        // Later edits continue the same history
        let edited = service.save(1, vault_id, write("final.md", "three")).await.unwrap();
        assert_eq!(edited.version, 2);
        let version = service.history_version(1, vault_id, renamed.id, 2).await.unwrap();
        assert_eq!(version.content, "three");
        assert_eq!(service.history(1, vault_id, renamed.id, 1, 10).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_restore_version() {
        let (service, vault_id, _temp) = create_test_service().await;

        let note = service.save(1, vault_id, write("r.md", "one")).await.unwrap();
        service.save(1, vault_id, write("r.md", "two")).await.unwrap();
        service.save(1, vault_id, write("r.md", "three")).await.unwrap();

        let restored = service
            .restore_version(1, vault_id, note.id, 1, "phone")
            .await
            .unwrap();
        assert_eq!(restored.id, note.id);
        assert_eq!(restored.content, "two");
        assert_eq!(restored.version, 3);
        assert_eq!(restored.client_name, "phone");

        let latest = service.history_version(1, vault_id, note.id, 3).await.unwrap();
        assert_eq!(latest.content, "two");
        assert_eq!(service.history(1, vault_id, note.id, 1, 10).await.unwrap().total, 3);
        assert_eq!(service.search(1, vault_id, "two", 10).await.unwrap().len(), 1);

        // Restoring what is already current changes nothing
        let again = service
            .restore_version(1, vault_id, note.id, 3, "phone")
            .await
            .unwrap();
        assert_eq!(again.version, 3);

        assert!(service
            .restore_version(1, vault_id, note.id, 9, "phone")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_conflict_path() {
        assert_eq!(
            conflict_path("notes/test.md", "20240101120000"),
            "notes/test.conflict.20240101120000.md"
        );
        assert_eq!(conflict_path("README", "1"), "README.conflict.1");
        assert_eq!(conflict_path(".hidden", "1"), ".hidden.conflict.1");
        assert_eq!(conflict_path("v1.2/file", "1"), "v1.2/file.conflict.1");
    }

    #[tokio::test]
    async fn test_save_with_base_merges_disjoint_edits() {
        let (service, vault_id, _temp) = create_test_service().await;

        service.save(1, vault_id, write("m.md", "alpha\nbeta\n")).await.unwrap();
        let base = service
            .save(1, vault_id, write("m.md", "alpha\nbeta\ngamma\n"))
            .await
            .unwrap();

        // Another device edits first
        service
            .save(1, vault_id, write("m.md", "ALPHA\nbeta\ngamma\n"))
            .await
            .unwrap();

        let outcome = service
            .save_with_base(
                1,
                vault_id,
                write("m.md", "alpha\nbeta\ngamma\ndelta\n"),
                &base.content_hash,
            )
            .await
            .unwrap();

        let SaveOutcome::Merged(note) = outcome else {
            panic!("expected a merge, got {:?}", outcome);
        };
        assert_eq!(note.content, "ALPHA\nbeta\ngamma\ndelta\n");
        assert_eq!(note.version, 3);

        // A write based on the current content is applied as is
        let outcome = service
            .save_with_base(1, vault_id, write("m.md", "fresh"), &note.content_hash)
            .await
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved(_)));
        assert_eq!(outcome.note().content, "fresh");
    }

    #[tokio::test]
    async fn test_save_with_base_keeps_conflicting_edit_as_copy() {
        let (service, vault_id, _temp) = create_test_service().await;

        service.save(1, vault_id, write("c.md", "status: draft")).await.unwrap();
        let base = service
            .save(1, vault_id, write("c.md", "status: review"))
            .await
            .unwrap();
        service
            .save(1, vault_id, write("c.md", "status: final"))
            .await
            .unwrap();

        let outcome = service
            .save_with_base(1, vault_id, write("c.md", "status: done"), &base.content_hash)
            .await
            .unwrap();

        let SaveOutcome::Conflict { current, copy } = outcome else {
            panic!("expected a conflict, got {:?}", outcome);
        };
        assert_eq!(current.content, "status: final");
        assert!(copy.path.starts_with("c.conflict."));
        assert!(copy.path.ends_with(".md"));
        assert_eq!(copy.content, "status: done");
        assert_eq!(
            service.get_by_path(1, vault_id, "c.md").await.unwrap().content,
            "status: final"
        );

        // Unknown base cannot be merged either
        let outcome = service
            .save_with_base(1, vault_id, write("c.md", "status: other"), "")
            .await
            .unwrap();
        let SaveOutcome::Conflict { copy: second, .. } = outcome else {
            panic!("expected a conflict, got {:?}", outcome);
        };
        assert_ne!(second.path, copy.path);
        assert_eq!(service.vaults.stats(1, vault_id).await.unwrap().note_count, 3);
    }

    #[tokio::test]
    async fn test_update_check() {
        let (service, vault_id, _temp) = create_test_service().await;
        let note = service.save(1, vault_id, write("u.md", "body")).await.unwrap();

        assert!(matches!(
            service.update_check(1, vault_id, "missing.md", "x", 0).await.unwrap(),
            UpdateCheck::Create
        ));
        assert!(matches!(
            service
                .update_check(1, vault_id, "u.md", &content_hash("other"), 2_000)
                .await
                .unwrap(),
            UpdateCheck::UpdateContent(_)
        ));
        assert!(matches!(
            service
                .update_check(1, vault_id, "u.md", &note.content_hash, 1_000)
                .await
                .unwrap(),
            UpdateCheck::UpdateMtime(_)
        ));

        let newer = service
            .update_check(1, vault_id, "u.md", &note.content_hash, 5_000)
            .await
            .unwrap();
        let UpdateCheck::InSync(synced) = newer else {
            panic!("expected in sync, got {:?}", newer);
        };
        assert_eq!(synced.mtime, 5_000);
        assert_eq!(synced.version, note.version);

        service.delete(1, vault_id, "u.md").await.unwrap();
        assert!(matches!(
            service
                .update_check(1, vault_id, "u.md", &note.content_hash, 5_000)
                .await
                .unwrap(),
            UpdateCheck::Create
        ));
    }
}
