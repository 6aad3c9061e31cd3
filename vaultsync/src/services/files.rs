//! File attachment service
//!
//! Blob bytes live at `file/f_<id>/file.dat`; rows keep path, hash and size.
//! Legacy rows that still point at a `save_path` are relocated on first open.

use super::vaults::VaultService;
use crate::config::BLOB_FILE;
use crate::database::models::{EntityAction, FileUpdate, ListQuery, NewFile, Page, VaultFile};
use crate::database::repository::{FileQueries, FileRepository};
use crate::error::{EngineError, Result};
use crate::serializer::WriteSerializer;
use crate::storage::{ContentKind, ContentStore};
use crate::versioning::{bytes_hash, path_hash};
use std::path::{Path, PathBuf};

/// Client push of one attachment
#[derive(Debug, Clone, Default)]
pub struct FileWrite {
    pub path: String,
    pub data: Vec<u8>,
    pub ctime: i64,
    pub mtime: i64,
}

#[derive(Clone)]
pub struct FileService {
    files: FileRepository,
    store: ContentStore,
    vaults: VaultService,
    serializer: WriteSerializer,
}

impl FileService {
    pub fn new(
        files: FileRepository,
        store: ContentStore,
        vaults: VaultService,
        serializer: WriteSerializer,
    ) -> Self {
        Self {
            files,
            store,
            vaults,
            serializer,
        }
    }

    fn folder(&self, uid: i64, id: i64) -> PathBuf {
        self.store.folder(uid, ContentKind::File, id)
    }

    /// Store an attachment. Identical bytes at a live path only touch metadata.
    pub async fn save(&self, uid: i64, vault_id: i64, write: FileWrite) -> Result<VaultFile> {
        let path = write.path.trim().trim_matches('/').to_string();
        if path.is_empty() {
            return Err(EngineError::InvalidInput("file path is empty".to_string()));
        }

        let this = self.clone();
        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;

                let hash = bytes_hash(&write.data);
                let size = write.data.len() as i64;
                let existing = this
                    .files
                    .find_by_path_hash_any(uid, vault_id, &path_hash(&path))
                    .await?;

                let file = match existing {
                    None => {
                        let file = this
                            .files
                            .create(
                                uid,
                                NewFile {
                                    vault_id,
                                    path,
                                    content_hash: hash,
                                    size,
                                    ctime: write.ctime,
                                    mtime: write.mtime,
                                },
                            )
                            .await?;
                        let folder = this.folder(uid, file.id);
                        if let Err(e) = this.store.save_bytes(&folder, BLOB_FILE, &write.data).await {
                            // No row without a blob
                            this.files.delete(uid, file.id).await?;
                            return Err(e);
                        }
                        tracing::info!("Created file {} for user {}", file.id, uid);
                        file
                    }
                    Some(current)
                        if current.content_hash == hash
                            && current.action != EntityAction::Delete =>
                    {
                        this.files
                            .update(
                                uid,
                                current.id,
                                FileUpdate {
                                    mtime: Some(write.mtime),
                                    ..Default::default()
                                },
                            )
                            .await?
                    }
                    Some(current) => {
                        this.store
                            .save_bytes(&this.folder(uid, current.id), BLOB_FILE, &write.data)
                            .await?;
                        this.files
                            .update(
                                uid,
                                current.id,
                                FileUpdate {
                                    action: Some(EntityAction::Modify),
                                    rename: Some(false),
                                    content_hash: Some(hash),
                                    save_path: Some(String::new()),
                                    size: Some(size),
                                    mtime: Some(write.mtime),
                                    ..Default::default()
                                },
                            )
                            .await?
                    }
                };

                this.vaults.refresh_file_stats(uid, vault_id).await?;
                Ok(file)
            })
            .await
    }

    pub async fn get(&self, uid: i64, vault_id: i64, path: &str) -> Result<VaultFile> {
        self.files
            .get_by_path_hash(uid, vault_id, &path_hash(path.trim().trim_matches('/')))
            .await
    }

    /// Path of the blob on disk, relocating legacy layouts on the way.
    ///
    /// Legacy rows are relocated in the owner's write lane so concurrent
    /// readers never race on the move. If the lane is busy the legacy path
    /// is served as is.
    pub async fn open(&self, uid: i64, file: &VaultFile) -> Result<PathBuf> {
        if file.save_path.is_empty() {
            return self.locate(uid, file.id, None).await;
        }

        let this = self.clone();
        let id = file.id;
        let opened = self
            .serializer
            .execute(uid, move || async move { this.open_in_lane(uid, id).await })
            .await;

        match opened {
            Err(e) if e.is_retryable() => {
                tracing::warn!("Serving legacy blob of file {} for user {} in place: {}", id, uid, e);
                let legacy = Path::new(&file.save_path);
                if tokio::fs::try_exists(legacy).await.unwrap_or(false) {
                    return Ok(legacy.to_path_buf());
                }
                self.locate(uid, id, None).await
            }
            opened => opened,
        }
    }

    /// `open` for callers already in the lane; rereads the row first.
    async fn open_in_lane(&self, uid: i64, id: i64) -> Result<PathBuf> {
        let file = self.files.get_by_id(uid, id).await?;
        let legacy = (!file.save_path.is_empty()).then(|| PathBuf::from(&file.save_path));

        let blob = self.locate(uid, id, legacy.as_deref()).await?;

        if legacy.is_some() && blob == self.folder(uid, id).join(BLOB_FILE) {
            let cleared = self
                .files
                .update(
                    uid,
                    id,
                    FileUpdate {
                        save_path: Some(String::new()),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = cleared {
                tracing::warn!("Failed to clear legacy path of file {} for user {}: {}", id, uid, e);
            }
        }

        Ok(blob)
    }

    async fn locate(&self, uid: i64, id: i64, legacy: Option<&Path>) -> Result<PathBuf> {
        self.store
            .ensure_file_blob(&self.folder(uid, id), legacy)
            .await?
            .ok_or_else(|| EngineError::not_found("file blob", id))
    }

    pub async fn read(&self, uid: i64, vault_id: i64, path: &str) -> Result<Vec<u8>> {
        let file = self.get(uid, vault_id, path).await?;
        let blob = self.open(uid, &file).await?;
        Ok(tokio::fs::read(blob).await?)
    }

    /// Copy the blob to a new row at `new_path`; the old row becomes a rename tombstone.
    pub async fn rename(&self, uid: i64, vault_id: i64, old_path: &str, new_path: &str) -> Result<VaultFile> {
        let old_path = old_path.trim().trim_matches('/').to_string();
        let new_path = new_path.trim().trim_matches('/').to_string();
        if old_path.is_empty() || new_path.is_empty() {
            return Err(EngineError::InvalidInput("file path is empty".to_string()));
        }

        let this = self.clone();
        self.serializer
            .execute(uid, move || async move {
                this.vaults.require_live(uid, vault_id).await?;

                let old = this
                    .files
                    .get_by_path_hash(uid, vault_id, &path_hash(&old_path))
                    .await?;
                if new_path == old.path {
                    return Ok(old);
                }

                if this
                    .files
                    .get_by_path_hash(uid, vault_id, &path_hash(&new_path))
                    .await
                    .is_ok()
                {
                    return Err(EngineError::InvalidInput(format!(
                        "file already exists at {}",
                        new_path
                    )));
                }

                let blob = this.open_in_lane(uid, old.id).await?;
                let data = tokio::fs::read(&blob).await?;
                let renamed = this
                    .files
                    .create(
                        uid,
                        NewFile {
                            vault_id,
                            path: new_path,
                            content_hash: old.content_hash.clone(),
                            size: old.size,
                            ctime: old.ctime,
                            mtime: old.mtime,
                        },
                    )
                    .await?;
                this.store
                    .save_bytes(&this.folder(uid, renamed.id), BLOB_FILE, &data)
                    .await?;

                this.files
                    .update(
                        uid,
                        old.id,
                        FileUpdate {
                            action: Some(EntityAction::Delete),
                            rename: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;

                this.vaults.refresh_file_stats(uid, vault_id).await?;
                tracing::info!("Renamed file {} to {} for user {}", old.id, renamed.id, uid);
                Ok(renamed)
            })
            .await
    }

    /// Soft delete; the blob stays until purge.
    pub async fn delete(&self, uid: i64, vault_id: i64, path: &str) -> Result<VaultFile> {
        let path = path.trim().trim_matches('/').to_string();
        let this = self.clone();

        self.serializer
            .execute(uid, move || async move {
                let current = this
                    .files
                    .get_by_path_hash(uid, vault_id, &path_hash(&path))
                    .await?;
                let file = this
                    .files
                    .update(
                        uid,
                        current.id,
                        FileUpdate {
                            action: Some(EntityAction::Delete),
                            rename: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;

                this.vaults.refresh_file_stats(uid, vault_id).await?;
                tracing::info!("Deleted file {} for user {}", file.id, uid);
                Ok(file)
            })
            .await
    }

    pub async fn list_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<VaultFile>> {
        self.files.list_by_updated_since(uid, vault_id, since).await
    }

    pub async fn list(&self, uid: i64, query: &ListQuery) -> Result<Page<VaultFile>> {
        self.files.list_paged(uid, query).await
    }

    pub async fn purge_deleted(&self, uid: i64, cutoff: i64) -> Result<usize> {
        let files = self.files.clone();
        self.serializer
            .execute(uid, move || async move {
                Ok(files.delete_physical_by_time(uid, cutoff).await?.len())
            })
            .await
    }
}
