//! Engine state and initialization
//!
//! This module builds every component from one `EngineConfig` and hands
//! them to each other explicitly. `Engine` is the single entry point for
//! embedders and owns the ordered shutdown.

use crate::config::EngineConfig;
use crate::database::repository::{
    FileRepository, FolderRepository, NoteHistoryRepository, NoteLinkRepository, NoteRepository,
    SettingRepository, UserRepository, VaultRepository,
};
use crate::database::SpaceRouter;
use crate::error::Result;
use crate::search::FtsIndex;
use crate::serializer::WriteSerializer;
use crate::services::{
    FileService, HistoryService, MaintenanceScheduler, NoteService, SettingService, VaultService,
};
use crate::storage::ContentStore;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Central engine state holding all services
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub router: Arc<SpaceRouter>,
    pub store: ContentStore,
    pub serializer: WriteSerializer,
    pub users: UserRepository,
    pub vaults: VaultService,
    pub notes: NoteService,
    pub history: HistoryService,
    pub files: FileService,
    pub settings: SettingService,
    pub fts: FtsIndex,
    scheduler: Mutex<Option<MaintenanceScheduler>>,
}

impl Engine {
    /// Open the registry and content store and wire the services.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        tracing::info!("Opening engine");

        let config = Arc::new(config);
        let router = Arc::new(SpaceRouter::open(&config).await?);

        let store = ContentStore::new(config.vault_root.clone());
        store.initialize().await?;

        let serializer = WriteSerializer::new(&config);

        let note_repo = NoteRepository::new(Arc::clone(&router), store.clone());
        let file_repo = FileRepository::new(Arc::clone(&router), store.clone());

        let vaults = VaultService::new(
            VaultRepository::new(Arc::clone(&router)),
            note_repo.clone(),
            file_repo.clone(),
            serializer.clone(),
        );
        let history = HistoryService::new(
            Arc::clone(&router),
            note_repo.clone(),
            NoteHistoryRepository::new(Arc::clone(&router), store.clone()),
            serializer.clone(),
            Arc::clone(&config),
        );
        let fts = FtsIndex::new(Arc::clone(&router), note_repo.clone());
        let notes = NoteService::new(
            note_repo,
            NoteLinkRepository::new(Arc::clone(&router)),
            FolderRepository::new(Arc::clone(&router)),
            history.clone(),
            vaults.clone(),
            fts.clone(),
            serializer.clone(),
        )?;
        let files = FileService::new(file_repo, store.clone(), vaults.clone(), serializer.clone());
        let settings = SettingService::new(
            SettingRepository::new(Arc::clone(&router), store.clone()),
            serializer.clone(),
        );
        let users = UserRepository::new(router.registry().clone());

        tracing::info!("Engine opened");

        Ok(Self {
            config,
            router,
            store,
            serializer,
            users,
            vaults,
            notes,
            history,
            files,
            settings,
            fts,
            scheduler: Mutex::new(None),
        })
    }

    /// Start the cron jobs. Calling it again is a no-op.
    pub async fn start_maintenance(&self) -> Result<()> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let scheduler = MaintenanceScheduler::new(
            Arc::clone(&self.router),
            self.history.clone(),
            self.notes.clone(),
            self.files.clone(),
            self.settings.clone(),
            Arc::clone(&self.config),
        )
        .await?;
        scheduler.start().await?;

        *slot = Some(scheduler);
        Ok(())
    }

    /// Ordered shutdown: debounce timers, write lanes, scheduler, databases.
    ///
    /// Returns `ShutdownIncomplete` when queued writes were abandoned at the
    /// deadline; the remaining steps still run.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down engine");

        self.history.cancel_pending();
        let drained = self
            .serializer
            .shutdown(self.config.shutdown_timeout())
            .await;

        if let Some(scheduler) = self.scheduler.lock().await.take() {
            if let Err(e) = scheduler.shutdown().await {
                tracing::warn!("Failed to stop maintenance scheduler: {}", e);
            }
        }

        self.router.close().await;

        match &drained {
            Ok(()) => tracing::info!("Engine shut down cleanly"),
            Err(e) => tracing::warn!("Engine shut down with errors: {}", e),
        }
        drained
    }
}
