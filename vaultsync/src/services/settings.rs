//! Settings service
//!
//! Per-vault client settings (`.obsidian/*.json` and the like). Stored like
//! notes, without history or search.

use crate::database::models::{EntityAction, NewSetting, Setting, SettingUpdate};
use crate::database::repository::{SettingQueries, SettingRepository};
use crate::error::{EngineError, Result};
use crate::serializer::WriteSerializer;
use crate::versioning::{content_hash, path_hash};

#[derive(Clone)]
pub struct SettingService {
    settings: SettingRepository,
    serializer: WriteSerializer,
}

impl SettingService {
    pub fn new(settings: SettingRepository, serializer: WriteSerializer) -> Self {
        Self {
            settings,
            serializer,
        }
    }

    /// Create or update a setting. Unchanged content keeps the row as is.
    pub async fn save(
        &self,
        uid: i64,
        vault_id: i64,
        path: &str,
        content: &str,
        mtime: i64,
    ) -> Result<Setting> {
        let path = path.trim().trim_matches('/').to_string();
        if path.is_empty() {
            return Err(EngineError::InvalidInput("setting path is empty".to_string()));
        }

        let settings = self.settings.clone();
        let content = content.to_string();

        self.serializer
            .execute(uid, move || async move {
                let existing = settings
                    .find_by_path_hash_any(uid, vault_id, &path_hash(&path))
                    .await?;

                match existing {
                    Some(current)
                        if current.content_hash == content_hash(&content)
                            && current.action != EntityAction::Delete =>
                    {
                        Ok(current)
                    }
                    Some(current) => {
                        settings
                            .update(
                                uid,
                                current.id,
                                SettingUpdate {
                                    action: Some(EntityAction::Modify),
                                    content: Some(content),
                                    mtime: Some(mtime),
                                    ..Default::default()
                                },
                            )
                            .await
                    }
                    None => {
                        settings
                            .create(
                                uid,
                                NewSetting {
                                    vault_id,
                                    path,
                                    content,
                                    ctime: mtime,
                                    mtime,
                                },
                            )
                            .await
                    }
                }
            })
            .await
    }

    pub async fn get(&self, uid: i64, vault_id: i64, path: &str) -> Result<Setting> {
        self.settings
            .get_by_path_hash(uid, vault_id, &path_hash(path.trim().trim_matches('/')))
            .await
    }

    pub async fn list_since(&self, uid: i64, vault_id: i64, since: i64) -> Result<Vec<Setting>> {
        self.settings.list_by_updated_since(uid, vault_id, since).await
    }

    pub async fn delete(&self, uid: i64, vault_id: i64, path: &str) -> Result<Setting> {
        let hash = path_hash(path.trim().trim_matches('/'));
        let settings = self.settings.clone();

        self.serializer
            .execute(uid, move || async move {
                let current = settings.get_by_path_hash(uid, vault_id, &hash).await?;
                settings
                    .update(
                        uid,
                        current.id,
                        SettingUpdate {
                            action: Some(EntityAction::Delete),
                            ..Default::default()
                        },
                    )
                    .await
            })
            .await
    }

    pub async fn purge_deleted(&self, uid: i64, cutoff: i64) -> Result<usize> {
        let settings = self.settings.clone();
        self.serializer
            .execute(uid, move || async move {
                Ok(settings.delete_physical_by_time(uid, cutoff).await?.len())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::database::repository::test_support::create_test_space;

    #[tokio::test]
    async fn test_save_is_noop_on_same_content() {
        let (router, store, _temp) = create_test_space().await;
        let service = SettingService::new(
            SettingRepository::new(router, store),
            WriteSerializer::new(&EngineConfig::default()),
        );

        let first = service
            .save(1, 1, ".obsidian/app.json", "{}", 10)
            .await
            .unwrap();
        let again = service
            .save(1, 1, ".obsidian/app.json", "{}", 20)
            .await
            .unwrap();
        assert_eq!(again.updated_timestamp, first.updated_timestamp);
        assert_eq!(again.mtime, 10);

        let changed = service
            .save(1, 1, ".obsidian/app.json", "{\"a\":1}", 30)
            .await
            .unwrap();
        assert_eq!(changed.id, first.id);
        assert_eq!(changed.content, "{\"a\":1}");

        service.delete(1, 1, ".obsidian/app.json").await.unwrap();
        assert!(service.get(1, 1, ".obsidian/app.json").await.unwrap_err().is_not_found());
        assert_eq!(service.list_since(1, 1, 0).await.unwrap().len(), 1);
    }
}
