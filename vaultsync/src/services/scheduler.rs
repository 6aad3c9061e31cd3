/// Maintenance scheduler
/// Runs the periodic snapshot sweep, history prune and soft-delete purge
/// across every registered user on cron schedules
use crate::config::EngineConfig;
use crate::database::repository::now_millis;
use crate::database::SpaceRouter;
use crate::error::{EngineError, Result};
use crate::services::{FileService, HistoryService, NoteService, SettingService};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

type TaskFuture = Pin<Box<dyn Future<Output = Result<usize>> + Send>>;

/// The work behind each job, callable directly as well
#[derive(Clone)]
struct MaintenanceTasks {
    router: Arc<SpaceRouter>,
    history: HistoryService,
    notes: NoteService,
    files: FileService,
    settings: SettingService,
    config: Arc<EngineConfig>,
}

impl MaintenanceTasks {
    async fn snapshot_sweep(&self) -> Result<usize> {
        self.history.sweep_pending().await
    }

    async fn history_prune(&self) -> Result<usize> {
        self.history.prune_all().await
    }

    async fn purge(&self) -> Result<usize> {
        if self.config.soft_delete_retention_days == 0 {
            return Ok(0);
        }
        let cutoff = now_millis() - i64::from(self.config.soft_delete_retention_days) * DAY_MS;

        let mut purged = 0;
        for uid in self.router.all_uids().await? {
            match self.notes.purge_deleted(uid, cutoff).await {
                Ok(count) => purged += count,
                Err(e) => tracing::warn!("Note purge failed for user {}: {}", uid, e),
            }
            match self.files.purge_deleted(uid, cutoff).await {
                Ok(count) => purged += count,
                Err(e) => tracing::warn!("File purge failed for user {}: {}", uid, e),
            }
            match self.settings.purge_deleted(uid, cutoff).await {
                Ok(count) => purged += count,
                Err(e) => tracing::warn!("Setting purge failed for user {}: {}", uid, e),
            }
        }

        if purged > 0 {
            tracing::info!("Purged {} soft-deleted entries", purged);
        }
        Ok(purged)
    }
}

/// Scheduler service for background maintenance
pub struct MaintenanceScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    tasks: MaintenanceTasks,
}

impl MaintenanceScheduler {
    /// Create new scheduler service
    pub async fn new(
        router: Arc<SpaceRouter>,
        history: HistoryService,
        notes: NoteService,
        files: FileService,
        settings: SettingService,
        config: Arc<EngineConfig>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Scheduler(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            tasks: MaintenanceTasks {
                router,
                history,
                notes,
                files,
                settings,
                config,
            },
        })
    }

    /// Register the three maintenance jobs and start the scheduler
    pub async fn start(&self) -> Result<()> {
        let config = Arc::clone(&self.tasks.config);

        let sweep = self.job("snapshot sweep", config.snapshot_sweep_cron.clone(), |tasks| -> TaskFuture {
            Box::pin(async move { tasks.snapshot_sweep().await })
        })?;
        let prune = self.job("history prune", config.history_prune_cron.clone(), |tasks| -> TaskFuture {
            Box::pin(async move { tasks.history_prune().await })
        })?;
        let purge = self.job("soft-delete purge", config.purge_cron.clone(), |tasks| -> TaskFuture {
            Box::pin(async move { tasks.purge().await })
        })?;

        let scheduler = self.scheduler.write().await;
        for job in [sweep, prune, purge] {
            scheduler
                .add(job)
                .await
                .map_err(|e| EngineError::Scheduler(format!("Failed to schedule job: {}", e)))?;
        }

        scheduler
            .start()
            .await
            .map_err(|e| EngineError::Scheduler(format!("Failed to start scheduler: {}", e)))?;

        tracing::info!(
            "Maintenance scheduler started (sweep: {}, prune: {}, purge: {})",
            config.snapshot_sweep_cron,
            config.history_prune_cron,
            config.purge_cron
        );
        Ok(())
    }

    fn job<F>(&self, name: &'static str, cron_expr: String, run: F) -> Result<Job>
    where
        F: Fn(MaintenanceTasks) -> TaskFuture + Send + Sync + 'static,
    {
        let tasks = self.tasks.clone();
        let run = Arc::new(run);

        Job::new_async(cron_expr.clone(), move |_uuid, _l| {
            let tasks = tasks.clone();
            let run = Arc::clone(&run);
            Box::pin(async move {
                tracing::debug!("Running scheduled {}", name);
                if let Err(e) = run(tasks).await {
                    tracing::error!("Scheduled {} failed: {}", name, e);
                }
            })
        })
        .map_err(|e| {
            EngineError::Scheduler(format!("Invalid cron '{}' for {}: {}", cron_expr, name, e))
        })
    }

    /// Run the snapshot sweep now
    pub async fn run_snapshot_sweep(&self) -> Result<usize> {
        self.tasks.snapshot_sweep().await
    }

    /// Run the history prune now
    pub async fn run_history_prune(&self) -> Result<usize> {
        self.tasks.history_prune().await
    }

    /// Run the soft-delete purge now
    pub async fn run_purge(&self) -> Result<usize> {
        self.tasks.purge().await
    }

    /// Shutdown scheduler gracefully
    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.write().await;
        scheduler
            .shutdown()
            .await
            .map_err(|e| EngineError::Scheduler(format!("Failed to shutdown scheduler: {}", e)))?;
        tracing::info!("Maintenance scheduler shutdown");
        Ok(())
    }
}
