use super::reconciler::{Reconciler, SyncOptions, sync_progress};
use crate::activity::{ActivityTracker, CreateJob, JOB_TYPE_SYNC, Job, JobStatus, JobUpdate};
use crate::error::{EngineError, EngineResult};
use crate::inventory::InventoryDb;
use crate::providers::ProviderService;
use crate::tasks::{JobContext, JobHandler, SyncJobData};
use crate::utils::now_secs;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Queue handler that reconciles one provider and refreshes its quota
pub struct SyncWorker {
    db: Arc<InventoryDb>,
    activity: ActivityTracker,
    providers: ProviderService,
}

impl SyncWorker {
    pub fn new(db: Arc<InventoryDb>, activity: ActivityTracker, providers: ProviderService) -> Self {
        Self {
            db,
            activity,
            providers,
        }
    }

    /// The unfinished sync job of a provider, reused across retries
    fn active_job(&self, data: &SyncJobData) -> EngineResult<Option<Job>> {
        Ok(self
            .activity
            .list_active(&data.workspace_id)?
            .into_iter()
            .find(|job| job.job_type == JOB_TYPE_SYNC && job.meta_str("providerId") == Some(data.provider_id.as_str())))
    }
}

#[async_trait]
impl JobHandler for SyncWorker {
    async fn handle(&self, ctx: &JobContext) -> EngineResult<()> {
        let data: SyncJobData = ctx.payload()?;
        let record = self.providers.get_provider(&data.provider_id, &data.workspace_id)?;

        let job = match self.active_job(&data)? {
            Some(job) => job,
            None => self.activity.create(
                CreateJob::new(&data.workspace_id, JOB_TYPE_SYNC, format!("Syncing {}", record.name))
                    .with_message("Starting sync...")
                    .with_metadata(json!({
                        "providerId": data.provider_id,
                        "recursive": data.recursive,
                        "pruneDeleted": data.prune_deleted,
                    })),
            )?,
        };
        self.activity.update(
            &job.id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .message("Starting sync...")
                .progress(0.0)
                .metadata(json!({ "retryAttempt": ctx.attempts_made(), "retryMax": ctx.max_attempts() })),
        )?;
        tracing::info!(
            target: "sync",
            job_id = %job.id,
            provider_id = %record.id,
            recursive = data.recursive,
            prune = data.prune_deleted,
            "Sync started"
        );

        let provider = self.providers.instance(&record)?;
        let options = SyncOptions {
            recursive: data.recursive,
            prune_deleted: data.prune_deleted,
        };
        let result = async {
            let summary = Reconciler::new(&self.db, provider.as_ref(), &record, &data.user_id, options)
                .run(|processed| {
                    let update = JobUpdate::new()
                        .progress(sync_progress(processed))
                        .message(format!("Syncing... ({} items)", processed))
                        .metadata(json!({ "processed": processed }));
                    if let Err(e) = self.activity.update(&job.id, update) {
                        tracing::debug!(target: "sync", job_id = %job.id, error = %e, "Failed to publish sync progress");
                    }
                })
                .await?;

            let quota = provider.get_quota().await?;
            self.db
                .update_provider_quota(&record.id, quota.used, quota.total)?;
            self.db.touch_provider_sync(&record.id, now_secs())?;
            Ok::<_, EngineError>(summary)
        }
        .await;
        provider.cleanup().await;
        let summary = result?;

        let metadata = serde_json::to_value(&summary).map_err(anyhow::Error::from)?;
        self.activity.complete(
            &job.id,
            format!("Sync completed successfully ({} items)", summary.processed),
            metadata,
        )?;
        tracing::info!(target: "sync", job_id = %job.id, provider_id = %record.id, processed = summary.processed, "Sync completed");
        Ok(())
    }

    async fn on_failed(&self, ctx: &JobContext, error: &EngineError, will_retry: bool) {
        let Ok(data) = ctx.payload::<SyncJobData>() else {
            return;
        };
        let job = match self.active_job(&data) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(target: "sync", provider_id = %data.provider_id, error = %e, "Failed to look up sync job");
                return;
            }
        };
        if let Err(e) = self.activity.record_attempt_failure(
            &job.id,
            error,
            ctx.attempts_made(),
            ctx.max_attempts(),
            will_retry,
        ) {
            tracing::warn!(target: "sync", job_id = %job.id, error = %e, "Failed to record sync failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::inventory::test_support::{provider_record, temp_db};
    use crate::providers::memory::{MemoryProvider, registry_with};
    use crate::tasks::{QueueJob, QueueJobStatus, SYNC_QUEUE};

    fn context(data: &SyncJobData, attempt: u32) -> JobContext {
        JobContext::new(QueueJob {
            id: data.dedup_key(),
            queue: SYNC_QUEUE.into(),
            payload: serde_json::to_value(data).unwrap(),
            status: QueueJobStatus::Active,
            attempts_made: attempt,
            max_attempts: 3,
            run_at: 0,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        })
    }

    #[tokio::test]
    async fn test_sync_job_completes_and_updates_provider() {
        let (db, _dir) = temp_db();
        let provider = Arc::new(MemoryProvider::new(false));
        provider.put("a.txt", b"12345");
        provider.put_folder("docs");
        db.insert_provider(&provider_record("p1", "ws", "memory")).unwrap();
        let activity = ActivityTracker::new(db.clone(), EventBroadcaster::new(64));
        let providers = ProviderService::new(db.clone(), Arc::new(registry_with(&[("memory", provider.clone())])));
        let worker = SyncWorker::new(db.clone(), activity.clone(), providers);

        let data = SyncJobData {
            provider_id: "p1".into(),
            workspace_id: "ws".into(),
            user_id: "alice".into(),
            recursive: true,
            prune_deleted: false,
        };
        worker.handle(&context(&data, 1)).await.unwrap();

        let record = db.get_provider("p1").unwrap().unwrap();
        assert_eq!(record.quota_used, 5);
        assert!(record.last_sync_at.is_some());
        assert_eq!(provider.cleanups(), 1);

        let jobs = db.list_jobs("ws", &[JobStatus::Completed]).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].meta_str("providerId"), Some("p1"));
        assert_eq!(jobs[0].metadata["filesCreated"], json!(1));
        assert!(activity.list_active("ws").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reuses_job_across_attempts() {
        let (db, _dir) = temp_db();
        db.insert_provider(&provider_record("p1", "ws", "unregistered")).unwrap();
        let activity = ActivityTracker::new(db.clone(), EventBroadcaster::new(64));
        let providers = ProviderService::new(db.clone(), Arc::new(registry_with(&[])));
        let worker = SyncWorker::new(db.clone(), activity.clone(), providers);
        let data = SyncJobData {
            provider_id: "p1".into(),
            workspace_id: "ws".into(),
            user_id: "alice".into(),
            recursive: true,
            prune_deleted: false,
        };

        for attempt in 1..=2 {
            let ctx = context(&data, attempt);
            let err = worker.handle(&ctx).await.unwrap_err();
            worker.on_failed(&ctx, &err, true).await;
        }

        let active = activity.list_active("ws").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, JobStatus::Pending);
        assert_eq!(active[0].metadata["retryAttempt"], json!(2));
    }
}
