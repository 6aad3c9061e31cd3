//! Filesystem content store
//!
//! Large text fields live outside the relational rows, one folder per entity:
//!
//! `<root>/u_<uid>/<kind>/<prefix>_<id>/<name>`
//!
//! Folder paths are pure functions of (uid, kind, id), so no lookup is
//! needed to find an entity's content and no two entities share a folder.

use crate::config::BLOB_FILE;
use crate::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Entity kinds with content folders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Note,
    File,
    Setting,
    History,
}

impl ContentKind {
    fn dir(&self) -> &'static str {
        match self {
            ContentKind::Note => "note",
            ContentKind::File => "file",
            ContentKind::Setting => "setting",
            ContentKind::History => "history",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            ContentKind::Note => "n",
            ContentKind::File => "f",
            ContentKind::Setting => "s",
            ContentKind::History => "h",
        }
    }
}

/// Per-entity folder store
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the root directory if needed
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        tracing::info!("Content store initialized at: {:?}", self.root);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_root(&self, uid: i64) -> PathBuf {
        self.root.join(format!("u_{}", uid))
    }

    /// Folder owned by one entity
    pub fn folder(&self, uid: i64, kind: ContentKind, id: i64) -> PathBuf {
        self.user_root(uid)
            .join(kind.dir())
            .join(format!("{}_{}", kind.prefix(), id))
    }

    pub async fn save(&self, folder: &Path, name: &str, content: &str) -> Result<()> {
        self.save_bytes(folder, name, content.as_bytes()).await
    }

    /// Write a file atomically: temp file, fsync, rename.
    pub async fn save_bytes(&self, folder: &Path, name: &str, data: &[u8]) -> Result<()> {
        fs::create_dir_all(folder).await?;

        let path = folder.join(name);
        let temp_path = folder.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!("Saved {:?} ({} bytes)", path, data.len());
        Ok(())
    }

    /// Read a text file. A missing file is `("", false)`, not an error.
    pub async fn load(&self, folder: &Path, name: &str) -> Result<(String, bool)> {
        match fs::read_to_string(folder.join(name)).await {
            Ok(content) => Ok((content, true)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok((String::new(), false)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a field, falling back to its legacy inline value.
    ///
    /// When only the inline value exists it is returned unchanged and copied
    /// into the store. A failed copy is logged and does not fail the read.
    pub async fn load_or_migrate(&self, folder: &Path, name: &str, inline: &str) -> Result<String> {
        match self.load(folder, name).await {
            Ok((content, true)) => Ok(content),
            Ok((_, false)) => {
                if inline.is_empty() {
                    return Ok(String::new());
                }

                match self.save(folder, name, inline).await {
                    Ok(()) => tracing::debug!("Migrated inline {} into {:?}", name, folder),
                    Err(e) => tracing::warn!(
                        "Failed to migrate inline {} into {:?}: {}",
                        name,
                        folder,
                        e
                    ),
                }

                Ok(inline.to_string())
            }
            Err(e) if !inline.is_empty() => {
                tracing::warn!("Failed to read {} in {:?}, using inline value: {}", name, folder, e);
                Ok(inline.to_string())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove an entity folder. A missing folder is not an error.
    pub async fn remove_folder(&self, folder: &Path) -> Result<()> {
        match fs::remove_dir_all(folder).await {
            Ok(()) => {
                tracing::debug!("Removed content folder {:?}", folder);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Locate a file blob at its fixed name, relocating legacy layouts.
    ///
    /// Order: `file.dat` already present, then the legacy path, then the first
    /// regular file found in the folder. Relocation is best-effort: when a
    /// move fails the blob is served from where it was found. Returns `None`
    /// when nothing exists.
    pub async fn ensure_file_blob(&self, folder: &Path, legacy: Option<&Path>) -> Result<Option<PathBuf>> {
        let target = folder.join(BLOB_FILE);

        if exists(&target).await {
            return Ok(Some(target));
        }

        if let Some(legacy) = legacy {
            if exists(legacy).await {
                return Ok(Some(adopt(legacy, &target, "legacy blob").await));
            }
            // A concurrent reader may have just moved it
            if exists(&target).await {
                return Ok(Some(target));
            }
        }

        let mut entries = match fs::read_dir(folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let skip = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".tmp") || n == BLOB_FILE)
                .unwrap_or(false);
            if skip {
                continue;
            }

            return Ok(Some(adopt(&path, &target, "stray file").await));
        }

        if exists(&target).await {
            return Ok(Some(target));
        }
        Ok(None)
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Move `from` to `to`, returning where the blob can be read afterwards.
async fn adopt(from: &Path, to: &Path, what: &str) -> PathBuf {
    match relocate(from, to).await {
        Ok(()) => {
            tracing::info!("Relocated {} {:?} to {:?}", what, from, to);
            to.to_path_buf()
        }
        Err(_) if exists(to).await => to.to_path_buf(),
        Err(e) => {
            tracing::warn!("Failed to relocate {} {:?}, serving it in place: {}", what, from, e);
            from.to_path_buf()
        }
    }
}

/// Rename, or copy then delete when rename fails (e.g. across devices).
async fn relocate(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }

    if let Err(e) = fs::rename(from, to).await {
        tracing::debug!("Rename {:?} failed ({}), copying instead", from, e);
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }

    Ok(())
}
