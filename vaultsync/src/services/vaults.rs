//! Vault service
//!
//! Vault lifecycle plus the aggregate counters other services refresh after
//! every mutation of notes or files.

use crate::database::models::Vault;
use crate::database::repository::{
    FileQueries, FileRepository, NoteQueries, NoteRepository, VaultQueries, VaultRepository,
    VaultStats,
};
use crate::error::{EngineError, Result};
use crate::serializer::WriteSerializer;

#[derive(Clone)]
pub struct VaultService {
    vaults: VaultRepository,
    notes: NoteRepository,
    files: FileRepository,
    serializer: WriteSerializer,
}

impl VaultService {
    pub fn new(
        vaults: VaultRepository,
        notes: NoteRepository,
        files: FileRepository,
        serializer: WriteSerializer,
    ) -> Self {
        Self {
            vaults,
            notes,
            files,
            serializer,
        }
    }

    /// Create a vault, or return the live vault already using `name`.
    pub async fn create(&self, uid: i64, name: &str) -> Result<Vault> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("vault name is empty".to_string()));
        }

        let vaults = self.vaults.clone();
        self.serializer
            .execute(uid, move || async move {
                match vaults.get_by_name(uid, &name).await {
                    Ok(existing) => Ok(existing),
                    Err(e) if e.is_not_found() => {
                        let vault = vaults.create(uid, &name).await?;
                        tracing::info!("Created vault {} ({}) for user {}", vault.id, name, uid);
                        Ok(vault)
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    pub async fn get(&self, uid: i64, id: i64) -> Result<Vault> {
        self.vaults.get_by_id(uid, id).await
    }

    pub async fn get_by_name(&self, uid: i64, name: &str) -> Result<Vault> {
        self.vaults.get_by_name(uid, name).await
    }

    pub async fn list(&self, uid: i64) -> Result<Vec<Vault>> {
        self.vaults.list(uid).await
    }

    /// Vault that exists and is not soft-deleted.
    pub async fn require_live(&self, uid: i64, id: i64) -> Result<Vault> {
        let vault = self.vaults.get_by_id(uid, id).await?;
        if vault.is_deleted {
            return Err(EngineError::not_found("vault", id));
        }
        Ok(vault)
    }

    pub async fn rename(&self, uid: i64, id: i64, name: &str) -> Result<Vault> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("vault name is empty".to_string()));
        }

        let vaults = self.vaults.clone();
        self.serializer
            .execute(uid, move || async move { vaults.rename(uid, id, &name).await })
            .await
    }

    /// Soft delete. The vault's content stays on disk.
    pub async fn delete(&self, uid: i64, id: i64) -> Result<()> {
        let vaults = self.vaults.clone();
        self.serializer
            .execute(uid, move || async move { vaults.soft_delete(uid, id).await })
            .await?;

        tracing::info!("Deleted vault {} for user {}", id, uid);
        Ok(())
    }

    pub async fn stats(&self, uid: i64, id: i64) -> Result<VaultStats> {
        let vault = self.vaults.get_by_id(uid, id).await?;
        Ok(VaultStats::from(&vault))
    }

    /// Recount live notes. Callers run this inside their serialized write.
    pub(crate) async fn refresh_note_stats(&self, uid: i64, vault_id: i64) -> Result<()> {
        let (count, size) = self.notes.count_size_sum(uid, vault_id).await?;
        self.vaults
            .update_note_stats(uid, vault_id, count, size)
            .await
    }

    /// Recount live files. Callers run this inside their serialized write.
    pub(crate) async fn refresh_file_stats(&self, uid: i64, vault_id: i64) -> Result<()> {
        let (count, size) = self.files.count_size_sum(uid, vault_id).await?;
        self.vaults
            .update_file_stats(uid, vault_id, count, size)
            .await
    }
}
