//! Job records and their publication. Every worker routes its state changes
//! through [`ActivityTracker`] so subscribers always see what the database holds.

mod models;

pub use models::{CreateJob, JOB_TYPE_PROVIDER_TRANSFER, JOB_TYPE_SYNC, Job, JobStatus, JobUpdate};

use crate::error::{EngineError, EngineResult};
use crate::events::EventBroadcaster;
use crate::inventory::InventoryDb;
use crate::uploader::UploadSessionState;
use crate::utils::now_secs;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct ActivityTracker {
    db: Arc<InventoryDb>,
    events: EventBroadcaster,
}

impl ActivityTracker {
    pub fn new(db: Arc<InventoryDb>, events: EventBroadcaster) -> Self {
        Self { db, events }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Create a pending job and publish it
    pub fn create(&self, params: CreateJob) -> EngineResult<Job> {
        let now = now_secs();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            workspace_id: params.workspace_id,
            job_type: params.job_type,
            title: params.title,
            message: params.message,
            status: JobStatus::Pending,
            progress: 0.0,
            metadata: params.metadata,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_job(&job)?;

        tracing::debug!(target: "activity", job_id = %job.id, job_type = %job.job_type, "Job created");
        self.events.job_updated(job.workspace_id.clone(), job.clone());
        Ok(job)
    }

    /// Apply a partial update and publish the full job. Updates to completed
    /// or cancelled jobs are dropped and the stored job is returned as is.
    pub fn update(&self, job_id: &str, update: JobUpdate) -> EngineResult<Job> {
        let now = now_secs();
        let (job, changed) = self
            .db
            .modify_job(job_id, |job| update.apply(job, now))?
            .ok_or_else(|| EngineError::not_found(format!("Job {}", job_id)))?;

        if changed {
            self.events.job_updated(job.workspace_id.clone(), job.clone());
        } else {
            tracing::debug!(target: "activity", job_id = %job_id, status = job.status.as_str(), "Ignoring update to terminal job");
        }
        Ok(job)
    }

    pub fn start(&self, job_id: &str, message: impl Into<String>) -> EngineResult<Job> {
        self.update(job_id, JobUpdate::new().status(JobStatus::Running).message(message))
    }

    pub fn progress(&self, job_id: &str, progress: f64, metadata: Value) -> EngineResult<Job> {
        self.update(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .progress(progress)
                .metadata(metadata),
        )
    }

    pub fn complete(&self, job_id: &str, message: impl Into<String>, metadata: Value) -> EngineResult<Job> {
        let job = self.update(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Completed)
                .progress(1.0)
                .message(message)
                .metadata(metadata),
        )?;
        tracing::info!(target: "activity", job_id = %job_id, "Job completed");
        Ok(job)
    }

    pub fn fail(&self, job_id: &str, message: impl Into<String>, metadata: Value) -> EngineResult<Job> {
        let message = message.into();
        tracing::warn!(target: "activity", job_id = %job_id, error = %message, "Job failed");
        self.update(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Error)
                .message(message)
                .metadata(metadata),
        )
    }

    pub fn cancel(&self, job_id: &str, message: impl Into<String>) -> EngineResult<Job> {
        tracing::info!(target: "activity", job_id = %job_id, "Job cancelled");
        self.update(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Cancelled)
                .message(message)
                .metadata(json!({ "phase": "cancelled", "cancelled": true })),
        )
    }

    /// Record a failed attempt. With attempts left the job goes back to
    /// pending so observers can see why it has not finished.
    pub fn record_attempt_failure(
        &self,
        job_id: &str,
        error: &EngineError,
        attempt: u32,
        max_attempts: u32,
        will_retry: bool,
    ) -> EngineResult<Job> {
        let metadata = json!({
            "phase": if will_retry { "retry" } else { "failed" },
            "retryAttempt": attempt,
            "retryMax": max_attempts,
            "willRetry": will_retry,
            "error": error.to_string(),
        });
        if will_retry {
            self.update(
                job_id,
                JobUpdate::new()
                    .status(JobStatus::Pending)
                    .message(format!("Attempt {} of {} failed, retrying: {}", attempt, max_attempts, error))
                    .metadata(metadata),
            )
        } else {
            self.fail(job_id, error.to_string(), metadata)
        }
    }

    pub fn get(&self, job_id: &str) -> EngineResult<Option<Job>> {
        Ok(self.db.get_job(job_id)?)
    }

    /// Pending and running jobs of a workspace
    pub fn list_active(&self, workspace_id: &str) -> EngineResult<Vec<Job>> {
        Ok(self
            .db
            .list_jobs(workspace_id, &[JobStatus::Pending, JobStatus::Running])?)
    }

    pub fn publish_upload_progress(&self, state: UploadSessionState) {
        self.events.upload_progress(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::inventory::test_support::temp_db;

    fn tracker() -> (ActivityTracker, tempfile::TempDir) {
        let (db, dir) = temp_db();
        (ActivityTracker::new(db, EventBroadcaster::new(16)), dir)
    }

    #[tokio::test]
    async fn test_every_mutation_is_published() {
        let (tracker, _dir) = tracker();
        let mut rx = tracker.events().subscribe();

        let job = tracker
            .create(CreateJob::new("ws", JOB_TYPE_SYNC, "Sync").with_metadata(json!({"providerId": "p1"})))
            .unwrap();
        tracker.progress(&job.id, 0.4, json!({"processed": 10})).unwrap();
        tracker.complete(&job.id, "done", json!({})).unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                Event::JobUpdated { workspace_id, job } => {
                    assert_eq!(workspace_id, "ws");
                    statuses.push(job.status);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(statuses, vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]);

        let stored = tracker.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.progress, 1.0);
        assert_eq!(stored.meta_str("providerId"), Some("p1"));
        assert_eq!(stored.metadata["processed"], json!(10));
    }

    #[tokio::test]
    async fn test_cancelled_job_stays_cancelled() {
        let (tracker, _dir) = tracker();
        let job = tracker.create(CreateJob::new("ws", JOB_TYPE_PROVIDER_TRANSFER, "Move")).unwrap();

        tracker.cancel(&job.id, "Cancelled by user").unwrap();
        let after = tracker.progress(&job.id, 0.9, json!({"phase": "upload"})).unwrap();

        assert_eq!(after.status, JobStatus::Cancelled);
        assert_eq!(after.meta_bool("cancelled"), Some(true));
        assert_eq!(after.meta_str("phase"), Some("cancelled"));
        assert!(tracker.list_active("ws").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_metadata() {
        let (tracker, _dir) = tracker();
        let job = tracker.create(CreateJob::new("ws", JOB_TYPE_SYNC, "Sync")).unwrap();
        let err = EngineError::Provider(crate::error::ProviderError::new("local", "boom"));

        let pending = tracker.record_attempt_failure(&job.id, &err, 1, 3, true).unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.meta_bool("willRetry"), Some(true));
        assert_eq!(pending.metadata["retryAttempt"], json!(1));

        let failed = tracker.record_attempt_failure(&job.id, &err, 3, 3, false).unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.meta_bool("willRetry"), Some(false));
        assert_eq!(failed.meta_str("phase"), Some("failed"));
        assert_eq!(failed.metadata["retryMax"], json!(3));
    }

    #[test]
    fn test_update_missing_job_is_not_found() {
        let (tracker, _dir) = tracker();
        let err = tracker.start("missing", "go").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
