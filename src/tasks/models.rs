use crate::error::{EngineError, EngineResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const UPLOAD_QUEUE: &str = "uploads";
pub const TRANSFER_QUEUE: &str = "transfers";
pub const SYNC_QUEUE: &str = "sync";

/// Lifecycle of a durable queue entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueJobStatus {
    /// Due at `run_at`
    Waiting,
    /// Claimed by a worker
    Active,
    Completed,
    /// Attempts exhausted or a non-retryable error
    Failed,
}

impl QueueJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueJobStatus::Waiting => "waiting",
            QueueJobStatus::Active => "active",
            QueueJobStatus::Completed => "completed",
            QueueJobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(QueueJobStatus::Waiting),
            "active" => Some(QueueJobStatus::Active),
            "completed" => Some(QueueJobStatus::Completed),
            "failed" => Some(QueueJobStatus::Failed),
            _ => None,
        }
    }

    /// Waiting and active entries absorb duplicate adds
    pub fn is_live(&self) -> bool {
        matches!(self, QueueJobStatus::Waiting | QueueJobStatus::Active)
    }
}

/// One entry in a durable queue. The id doubles as the de-duplication key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueJob {
    pub id: String,
    pub queue: String,
    pub payload: Value,
    pub status: QueueJobStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Unix milliseconds
    pub run_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueueJob {
    /// Decode the payload. A malformed payload can never succeed, so it is a
    /// validation error and is not retried.
    pub fn payload_as<T: DeserializeOwned>(&self) -> EngineResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EngineError::validation(format!("Invalid payload for queue job {}: {}", self.id, e))
        })
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}
