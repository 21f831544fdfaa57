//! Provider tree reconciliation.

mod reconciler;
mod worker;

pub use reconciler::{PROGRESS_EVERY, Reconciler, SyncOptions, SyncSummary, sync_progress};
pub use worker::SyncWorker;

use crate::error::EngineResult;
use crate::providers::ProviderService;
use crate::tasks::{JobQueue, SyncJobData};
use std::sync::Arc;

#[derive(Clone)]
pub struct SyncService {
    providers: ProviderService,
    queue: Arc<JobQueue>,
}

impl SyncService {
    pub fn new(providers: ProviderService, queue: Arc<JobQueue>) -> Self {
        Self { providers, queue }
    }

    /// Queue a sync of one provider. A sync already queued or running for
    /// the same provider absorbs the request. Returns the queue entry id.
    pub fn request_sync(
        &self,
        provider_id: &str,
        workspace_id: &str,
        user_id: &str,
        options: SyncOptions,
    ) -> EngineResult<String> {
        let record = self.providers.get_provider(provider_id, workspace_id)?;
        let data = SyncJobData {
            provider_id: record.id,
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            recursive: options.recursive,
            prune_deleted: options.prune_deleted,
        };
        let id = self.queue.add(&data.dedup_key(), &data)?;
        tracing::info!(target: "sync", provider_id = %provider_id, queue_job_id = %id, "Sync requested");
        Ok(id)
    }
}
