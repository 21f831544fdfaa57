mod models;
mod queue;
mod types;
mod worker;

pub use models::{QueueJob, QueueJobStatus, SYNC_QUEUE, TRANSFER_QUEUE, UPLOAD_QUEUE};
pub use queue::{AttemptOutcome, JobQueue};
pub use types::{
    SyncJobData, TransferJobData, UploadJobData, sync_job_key, transfer_job_key, upload_job_key,
};
pub use worker::{JobContext, JobHandler, WorkerPool};
