//! Wiring of every service, queue and worker pool from one [`EngineConfig`].

use crate::activity::ActivityTracker;
use crate::api::AppState;
use crate::cache::FastCache;
use crate::config::EngineConfig;
use crate::crypto::ConfigCipher;
use crate::events::EventBroadcaster;
use crate::files::FileCatalog;
use crate::inventory::InventoryDb;
use crate::providers::{ProviderRegistry, ProviderService};
use crate::sync::{SyncService, SyncWorker};
use crate::tasks::{JobQueue, SYNC_QUEUE, TRANSFER_QUEUE, UPLOAD_QUEUE, WorkerPool};
use crate::transfer::{TransferEngine, TransferService};
use crate::uploader::{UploadService, UploadSessionManager, UploadWorker};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Engine {
    pub config: EngineConfig,
    pub db: Arc<InventoryDb>,
    pub cache: Arc<FastCache>,
    pub events: EventBroadcaster,
    pub activity: ActivityTracker,
    pub providers: ProviderService,
    pub sessions: Arc<UploadSessionManager>,
    pub uploads: UploadService,
    pub files: FileCatalog,
    pub transfers: TransferService,
    pub syncs: SyncService,
    upload_queue: Arc<JobQueue>,
    transfer_queue: Arc<JobQueue>,
    sync_queue: Arc<JobQueue>,
}

impl Engine {
    /// Open the database and build every service
    pub fn build(config: EngineConfig) -> Result<Self> {
        let db = Arc::new(InventoryDb::with_path(config.database_path()).context("Failed to open inventory database")?);
        std::fs::create_dir_all(&config.upload_temp_dir).context("Failed to create upload temp directory")?;
        std::fs::create_dir_all(&config.transfer_cache_dir).context("Failed to create transfer cache directory")?;

        let cache = Arc::new(FastCache::new());
        let events = EventBroadcaster::new(EVENT_CAPACITY);
        let activity = ActivityTracker::new(db.clone(), events.clone());
        let registry = Arc::new(ProviderRegistry::with_defaults(ConfigCipher::new(&config.config_secret)));
        let providers = ProviderService::new(db.clone(), registry);

        let settings = &config.queues;
        let upload_queue = Arc::new(JobQueue::new(UPLOAD_QUEUE, db.clone(), settings.uploads, settings));
        let transfer_queue = Arc::new(JobQueue::new(TRANSFER_QUEUE, db.clone(), settings.transfers, settings));
        let sync_queue = Arc::new(JobQueue::new(SYNC_QUEUE, db.clone(), settings.sync, settings));

        let sessions = Arc::new(UploadSessionManager::new(
            db.clone(),
            cache.clone(),
            activity.clone(),
            config.upload_temp_dir.clone(),
            config.upload.chunk_size,
            config.session_ttl(),
        ));
        let uploads = UploadService::new(sessions.clone(), upload_queue.clone());
        let files = FileCatalog::new(db.clone(), providers.clone());
        let transfers = TransferService::new(
            db.clone(),
            cache.clone(),
            activity.clone(),
            providers.clone(),
            transfer_queue.clone(),
            config.transfer_cache_dir.clone(),
            config.cancel_ttl(),
        );
        let syncs = SyncService::new(providers.clone(), sync_queue.clone());

        Ok(Self {
            config,
            db,
            cache,
            events,
            activity,
            providers,
            sessions,
            uploads,
            files,
            transfers,
            syncs,
            upload_queue,
            transfer_queue,
            sync_queue,
        })
    }

    /// Return jobs left `active` by a previous process to `waiting`
    pub fn recover_stalled(&self) -> Result<usize> {
        let mut recovered = 0;
        for queue in [&self.upload_queue, &self.transfer_queue, &self.sync_queue] {
            recovered += queue.recover_stalled()?;
        }
        Ok(recovered)
    }

    /// Start one worker pool per queue
    pub fn spawn_workers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let poll = self.config.queues.poll_interval();
        let upload_worker = UploadWorker::new(
            self.db.clone(),
            self.sessions.clone(),
            self.providers.clone(),
            self.config.upload.progress_interval_bytes,
        );
        let transfer_engine = TransferEngine::new(
            self.db.clone(),
            self.cache.clone(),
            self.activity.clone(),
            self.providers.clone(),
            self.config.transfer_cache_dir.clone(),
            self.config.transfer.checkpoint_size,
        );
        let sync_worker = SyncWorker::new(self.db.clone(), self.activity.clone(), self.providers.clone());

        vec![
            WorkerPool::new(
                self.upload_queue.clone(),
                Arc::new(upload_worker),
                self.config.queues.uploads.concurrency,
                poll,
            )
            .spawn(shutdown.clone()),
            WorkerPool::new(
                self.transfer_queue.clone(),
                Arc::new(transfer_engine),
                self.config.queues.transfers.concurrency,
                poll,
            )
            .spawn(shutdown.clone()),
            WorkerPool::new(
                self.sync_queue.clone(),
                Arc::new(sync_worker),
                self.config.queues.sync.concurrency,
                poll,
            )
            .spawn(shutdown.clone()),
        ]
    }

    /// Periodically drop expired upload sessions and cache entries
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sessions.cleanup_expired_sessions().await {
                            tracing::warn!(target: "main", error = %e, "Session sweep failed");
                        }
                        let purged = cache.purge_expired();
                        tracing::trace!(target: "main", purged, "Cache sweep finished");
                    }
                }
            }
            tracing::debug!(target: "main", "Sweeper stopped");
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            uploads: self.uploads.clone(),
            files: self.files.clone(),
            events: self.events.clone(),
            max_chunk_bytes: usize::try_from(self.config.upload.chunk_size)
                .unwrap_or(usize::MAX)
                .saturating_add(64 * 1024),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncOptions;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            data_dir: dir.path().to_path_buf(),
            upload_temp_dir: dir.path().join("uploads"),
            transfer_cache_dir: dir.path().join("transfers"),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::build(config(&dir)).unwrap();
        assert!(dir.path().join("drivebase.db").exists());
        assert!(dir.path().join("transfers").is_dir());
        assert_eq!(engine.recover_stalled().unwrap(), 0);

        let token = CancellationToken::new();
        let mut handles = engine.spawn_workers(&token);
        handles.push(engine.spawn_sweeper(token.clone()));
        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sync_request_for_unknown_provider() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::build(config(&dir)).unwrap();
        assert!(
            engine
                .syncs
                .request_sync("missing", "ws", "alice", SyncOptions::default())
                .is_err()
        );
    }
}
