use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job type for cross-provider moves
pub const JOB_TYPE_PROVIDER_TRANSFER: &str = "provider_transfer";
/// Job type for provider tree reconciliation
pub const JOB_TYPE_SYNC: &str = "sync";

/// Job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in a queue, or waiting for a retry
    Pending,
    Running,
    Completed,
    /// Failed after the queue gave up
    Error,
    /// Stopped by the user
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "error" => Some(JobStatus::Error),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal jobs ignore further updates. `Error` is not terminal because a
    /// user retry moves it back to pending.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

/// A user-visible unit of progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub title: String,
    pub message: Option<String>,
    pub status: JobStatus,
    /// 0.0 - 1.0
    pub progress: f64,
    pub metadata: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }
}

/// Parameters for a new job
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub workspace_id: String,
    pub job_type: String,
    pub title: String,
    pub message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl CreateJob {
    pub fn new(workspace_id: impl Into<String>, job_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            job_type: job_type.into(),
            title: title.into(),
            message: None,
            metadata: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Non-object values are ignored
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata = map;
        }
        self
    }
}

/// Partial update of a job. Metadata is merged shallowly into the existing bag.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata.extend(map);
        }
        self
    }

    /// Apply to a job in place. Returns false when the job is terminal and
    /// nothing was changed.
    pub fn apply(self, job: &mut Job, now: i64) -> bool {
        if job.status.is_terminal() {
            return false;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(progress) = self.progress {
            job.progress = if progress.is_finite() {
                progress.clamp(0.0, 1.0)
            } else {
                job.progress
            };
        }
        if let Some(message) = self.message {
            job.message = Some(message);
        }
        job.metadata.extend(self.metadata);
        job.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(status: JobStatus) -> Job {
        Job {
            id: "j1".to_string(),
            workspace_id: "ws".to_string(),
            job_type: JOB_TYPE_SYNC.to_string(),
            title: "Sync".to_string(),
            message: None,
            status,
            progress: 0.2,
            metadata: json!({"phase": "download", "fileId": "f1"})
                .as_object()
                .cloned()
                .unwrap(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn test_update_merges_metadata_shallowly() {
        let mut j = job(JobStatus::Running);
        let changed = JobUpdate::new()
            .progress(0.5)
            .metadata(json!({"phase": "upload", "uploadedBytes": 10}))
            .apply(&mut j, 7);

        assert!(changed);
        assert_eq!(j.progress, 0.5);
        assert_eq!(j.meta_str("phase"), Some("upload"));
        assert_eq!(j.meta_str("fileId"), Some("f1"));
        assert_eq!(j.metadata["uploadedBytes"], json!(10));
        assert_eq!(j.updated_at, 7);
    }

    #[test]
    fn test_terminal_job_ignores_updates() {
        let mut j = job(JobStatus::Cancelled);
        let changed = JobUpdate::new()
            .status(JobStatus::Running)
            .progress(0.9)
            .apply(&mut j, 7);

        assert!(!changed);
        assert_eq!(j.status, JobStatus::Cancelled);
        assert_eq!(j.progress, 0.2);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut j = job(JobStatus::Error);
        JobUpdate::new().progress(3.0).apply(&mut j, 2);
        assert_eq!(j.progress, 1.0);
        JobUpdate::new().progress(f64::NAN).apply(&mut j, 3);
        assert_eq!(j.progress, 1.0);
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let value = serde_json::to_value(job(JobStatus::Pending)).unwrap();
        assert_eq!(value["workspaceId"], "ws");
        assert_eq!(value["type"], "sync");
        assert_eq!(value["status"], "pending");
    }
}
