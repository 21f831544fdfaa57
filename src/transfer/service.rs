use super::engine::{discard_transfer, transfer_cancel_key};
use crate::activity::{ActivityTracker, CreateJob, JOB_TYPE_PROVIDER_TRANSFER, Job, JobStatus, JobUpdate};
use crate::cache::FastCache;
use crate::error::{EngineError, EngineResult};
use crate::inventory::InventoryDb;
use crate::providers::ProviderService;
use crate::tasks::{JobQueue, TransferJobData, transfer_job_key};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// User-facing operations on provider-to-provider moves
#[derive(Clone)]
pub struct TransferService {
    db: Arc<InventoryDb>,
    cache: Arc<FastCache>,
    activity: ActivityTracker,
    providers: ProviderService,
    queue: Arc<JobQueue>,
    cache_root: PathBuf,
    cancel_ttl: Duration,
}

impl TransferService {
    pub fn new(
        db: Arc<InventoryDb>,
        cache: Arc<FastCache>,
        activity: ActivityTracker,
        providers: ProviderService,
        queue: Arc<JobQueue>,
        cache_root: PathBuf,
        cancel_ttl: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            activity,
            providers,
            queue,
            cache_root,
            cancel_ttl,
        }
    }

    /// Queue a move of `file_id` to `target_provider_id`. Requesting a move
    /// that is already queued or running returns its job.
    pub fn request_transfer(
        &self,
        workspace_id: &str,
        user_id: &str,
        file_id: &str,
        target_provider_id: &str,
    ) -> EngineResult<Job> {
        let file = self
            .db
            .get_file(file_id)?
            .filter(|f| !f.is_deleted && f.workspace_id == workspace_id)
            .ok_or_else(|| EngineError::not_found("File"))?;
        if file.provider_id == target_provider_id {
            return Err(EngineError::validation("File is already on this provider"));
        }
        self.providers.get_provider(&file.provider_id, workspace_id)?;
        let target = self.providers.get_provider(target_provider_id, workspace_id)?;
        if !target.is_active {
            return Err(EngineError::validation(format!("Provider {} is not active", target.name)));
        }

        let key = transfer_job_key(&file.id, target_provider_id);
        if let Some(queued) = self.queue.get(&key)?.filter(|job| job.status.is_live()) {
            let payload: TransferJobData = queued.payload_as()?;
            if let Some(job) = self.activity.get(&payload.job_id)? {
                tracing::debug!(target: "transfer", job_id = %job.id, "Transfer already queued");
                return Ok(job);
            }
        }

        let job = self.activity.create(
            CreateJob::new(
                workspace_id,
                JOB_TYPE_PROVIDER_TRANSFER,
                format!("Move {} to {}", file.name, target.name),
            )
            .with_message("Queued")
            .with_metadata(json!({
                "fileId": file.id,
                "fileName": file.name,
                "sourceProviderId": file.provider_id,
                "targetProviderId": target_provider_id,
                "totalSize": file.size,
                "phase": "queued",
            })),
        )?;

        let data = TransferJobData {
            job_id: job.id.clone(),
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            file_id: file.id.clone(),
            target_provider_id: target_provider_id.to_string(),
        };
        self.queue.add(&data.dedup_key(), &data)?;

        tracing::info!(
            target: "transfer",
            job_id = %job.id,
            file_id = %file.id,
            target_provider_id = %target_provider_id,
            "Transfer queued"
        );
        Ok(job)
    }

    /// Ask a transfer to stop. A transfer that has not started is dropped from
    /// the queue and cancelled right away; a running one stops at its next
    /// checkpoint.
    pub async fn cancel_transfer(&self, workspace_id: &str, job_id: &str) -> EngineResult<Job> {
        let job = self.transfer_job(workspace_id, job_id)?;
        match job.status {
            JobStatus::Cancelled => return Ok(job),
            JobStatus::Completed => return Err(EngineError::validation("Transfer already completed")),
            _ => {}
        }

        self.cache
            .set_ex(transfer_cancel_key(job_id), "1", self.cancel_ttl);

        let removed = match queue_key(&job) {
            Some(key) => self.queue.remove_waiting(&key)?,
            None => false,
        };
        if removed || job.status == JobStatus::Error {
            // No worker will see this job again, so its leftovers go now
            self.discard_leftovers(&job).await;
            return self.activity.cancel(job_id, "Transfer cancelled");
        }

        tracing::info!(target: "transfer", job_id = %job_id, "Cancellation requested for running transfer");
        Ok(job)
    }

    /// Re-queue a transfer that exhausted its attempts. It resumes from its
    /// manifest.
    pub fn retry_transfer(&self, workspace_id: &str, job_id: &str) -> EngineResult<Job> {
        let job = self.transfer_job(workspace_id, job_id)?;
        if job.status != JobStatus::Error {
            return Err(EngineError::validation("Only failed transfers can be retried"));
        }
        let key = queue_key(&job).ok_or_else(|| EngineError::validation("Transfer job has no queue entry"))?;
        if !self.queue.retry_failed(&key)? {
            return Err(EngineError::validation("Transfer is not in a failed state"));
        }

        self.activity.update(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Pending)
                .message("Retry requested")
                .metadata(json!({ "phase": "queued", "willRetry": true })),
        )
    }

    fn transfer_job(&self, workspace_id: &str, job_id: &str) -> EngineResult<Job> {
        self.activity
            .get(job_id)?
            .filter(|job| job.workspace_id == workspace_id && job.job_type == JOB_TYPE_PROVIDER_TRANSFER)
            .ok_or_else(|| EngineError::not_found("Transfer job"))
    }
}

impl TransferService {
    async fn discard_leftovers(&self, job: &Job) {
        let (Some(file_id), Some(target_id)) = (job.meta_str("fileId"), job.meta_str("targetProviderId")) else {
            return;
        };
        let target = self
            .providers
            .get_provider(target_id, &job.workspace_id)
            .and_then(|record| self.providers.instance(&record));
        let target = match target {
            Ok(target) => Some(target),
            Err(e) => {
                tracing::warn!(target: "transfer", job_id = %job.id, error = %e, "Target provider unavailable, only local leftovers are removed");
                None
            }
        };
        discard_transfer(&self.cache_root, &job.workspace_id, file_id, target_id, target.as_deref()).await;
        if let Some(target) = target {
            target.cleanup().await;
        }
    }
}

fn queue_key(job: &Job) -> Option<String> {
    Some(transfer_job_key(job.meta_str("fileId")?, job.meta_str("targetProviderId")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::tasks::{JobHandler, QueueJobStatus, TRANSFER_QUEUE};
    use crate::transfer::engine::test_support::{TransferFixture, context, fixture};

    fn service(fx: &TransferFixture) -> TransferService {
        let settings = QueueSettings::default();
        let queue = Arc::new(JobQueue::new(TRANSFER_QUEUE, fx.db.clone(), settings.transfers, &settings));
        TransferService::new(
            fx.db.clone(),
            fx.cache.clone(),
            fx.activity.clone(),
            fx.providers.clone(),
            queue,
            fx.cache_root.path().to_path_buf(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_request_creates_job_and_dedups() {
        let fx = fixture(true);
        let service = service(&fx);

        let job = service.request_transfer("ws", "alice", "f1", "dst").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.meta_str("phase"), Some("queued"));
        assert_eq!(job.meta_str("sourceProviderId"), Some("src"));
        assert_eq!(job.metadata["totalSize"], json!(30));

        let queued = service.queue.get("file-transfer:f1:dst").unwrap().unwrap();
        let payload: TransferJobData = queued.payload_as().unwrap();
        assert_eq!(payload.job_id, job.id);

        let again = service.request_transfer("ws", "alice", "f1", "dst").unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(service.queue.count(QueueJobStatus::Waiting).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let fx = fixture(true);
        let service = service(&fx);

        let same = service.request_transfer("ws", "alice", "f1", "src").unwrap_err();
        assert!(matches!(same, EngineError::Validation(_)));
        let other_ws = service.request_transfer("other", "alice", "f1", "dst").unwrap_err();
        assert!(matches!(other_ws, EngineError::NotFound(_)));
        let unknown = service.request_transfer("ws", "alice", "f1", "nope").unwrap_err();
        assert!(matches!(unknown, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_start_removes_queue_entry() {
        let fx = fixture(true);
        let service = service(&fx);
        let job = service.request_transfer("ws", "alice", "f1", "dst").unwrap();

        let cancelled = service.cancel_transfer("ws", &job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.meta_bool("cancelled"), Some(true));
        assert!(service.queue.get("file-transfer:f1:dst").unwrap().is_none());
        assert!(fx.cache.exists(&transfer_cancel_key(&job.id)));

        // Idempotent
        assert_eq!(service.cancel_transfer("ws", &job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_transfer_is_picked_up_by_worker() {
        let fx = fixture(true);
        let service = service(&fx);
        let job = service.request_transfer("ws", "alice", "f1", "dst").unwrap();
        let claimed = service.queue.claim_next().unwrap().unwrap();

        let requested = service.cancel_transfer("ws", &job.id).await.unwrap();
        assert_eq!(requested.status, JobStatus::Pending);

        let payload: TransferJobData = claimed.payload_as().unwrap();
        fx.engine.handle(&context(&payload, 1)).await.unwrap();
        let job = fx.activity.get(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(fx.source.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_attempts_discards_leftovers() {
        let fx = fixture(true);
        let service = service(&fx);
        let job = service.request_transfer("ws", "alice", "f1", "dst").unwrap();

        // First attempt opens the upload and fails on part 1, the entry waits for its retry
        let claimed = service.queue.claim_next().unwrap().unwrap();
        let payload: TransferJobData = claimed.payload_as().unwrap();
        fx.target.fail_next_uploads(1);
        let err = fx.engine.handle(&context(&payload, 1)).await.unwrap_err();
        service.queue.fail_attempt(&claimed, &err).unwrap();
        let upload_id = fx.dir().load().await.unwrap().multipart.unwrap().upload_id;

        let cancelled = service.cancel_transfer("ws", &job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(fx.target.aborted(), vec![upload_id]);
        assert!(!fx.dir().path().exists());
        assert!(fx.source.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_retry_requires_failed_transfer() {
        let fx = fixture(true);
        let service = service(&fx);
        let job = service.request_transfer("ws", "alice", "f1", "dst").unwrap();

        let err = service.retry_transfer("ws", &job.id).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let claimed = service.queue.claim_next().unwrap().unwrap();
        let failure = EngineError::validation("permanent");
        service.queue.fail_attempt(&claimed, &failure).unwrap();
        fx.activity
            .record_attempt_failure(&job.id, &failure, 1, 5, false)
            .unwrap();

        let retried = service.retry_transfer("ws", &job.id).unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(
            service.queue.get("file-transfer:f1:dst").unwrap().unwrap().status,
            QueueJobStatus::Waiting
        );
    }
}
