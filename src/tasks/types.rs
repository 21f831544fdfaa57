//! Payload shapes carried by the durable queues. Field names are stable
//! on the wire because entries may outlive the build that wrote them.

use serde::{Deserialize, Serialize};

/// Drain an assembled upload to its provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadJobData {
    pub session_id: String,
    pub file_id: String,
    pub provider_id: String,
    pub assembled_file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
}

impl UploadJobData {
    pub fn dedup_key(&self) -> String {
        upload_job_key(&self.session_id)
    }
}

/// Move a file to another provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferJobData {
    pub job_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub file_id: String,
    pub target_provider_id: String,
}

impl TransferJobData {
    pub fn dedup_key(&self) -> String {
        transfer_job_key(&self.file_id, &self.target_provider_id)
    }
}

/// Reconcile a provider's tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncJobData {
    pub provider_id: String,
    pub workspace_id: String,
    pub user_id: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub prune_deleted: bool,
}

impl SyncJobData {
    pub fn dedup_key(&self) -> String {
        sync_job_key(&self.provider_id)
    }
}

fn default_true() -> bool {
    true
}

pub fn upload_job_key(session_id: &str) -> String {
    format!("upload-{}", session_id)
}

pub fn transfer_job_key(file_id: &str, target_provider_id: &str) -> String {
    format!("file-transfer:{}:{}", file_id, target_provider_id)
}

pub fn sync_job_key(provider_id: &str) -> String {
    format!("sync-{}", provider_id)
}
