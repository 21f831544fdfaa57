//! Chunked client uploads.
//!
//! Clients send a file in fixed-size chunks to an [`UploadSessionManager`]
//! session. Once every chunk is in, the chunks are assembled on local disk
//! and an upload job hands the file to [`UploadWorker`], which pushes it to
//! the target provider.

mod chunk;
mod progress;
mod session;
mod worker;

pub use chunk::{ChunkInfo, chunk_count, expected_chunk_size, plan_chunks, read_range, stream_file, stream_range};
pub use progress::{FnProgress, ProgressCallback, ProgressStream, ProgressUpdate};
pub use session::{
    ActiveUpload, CreateSessionParams, CreatedSession, ReceiveChunkResult, UploadPhase, UploadSession,
    UploadSessionManager, UploadSessionState, UploadStatus,
};
pub use worker::UploadWorker;

use crate::error::EngineResult;
use crate::tasks::{JobQueue, UploadJobData};
use bytes::Bytes;
use std::sync::Arc;

/// Entry point for the chunk endpoint and the user-facing session operations
#[derive(Clone)]
pub struct UploadService {
    sessions: Arc<UploadSessionManager>,
    queue: Arc<JobQueue>,
}

impl UploadService {
    pub fn new(sessions: Arc<UploadSessionManager>, queue: Arc<JobQueue>) -> Self {
        Self { sessions, queue }
    }

    pub fn sessions(&self) -> &Arc<UploadSessionManager> {
        &self.sessions
    }

    pub async fn create_session(&self, params: CreateSessionParams) -> EngineResult<CreatedSession> {
        self.sessions.create_session(params).await
    }

    /// Store a chunk; the chunk that completes the set also triggers assembly
    /// and queues the provider upload
    pub async fn receive_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
        user_id: &str,
    ) -> EngineResult<ReceiveChunkResult> {
        let result = self
            .sessions
            .receive_chunk(session_id, chunk_index, data, user_id)
            .await?;

        if result.needs_assembly {
            self.sessions.assemble_chunks(session_id).await?;
            let session = self.sessions.load_session(session_id)?;
            let job_id = self.enqueue(&session)?;
            tracing::debug!(
                target: "uploader",
                session_id = %session_id,
                job_id = %job_id,
                "All chunks received, upload job enqueued"
            );
        }
        Ok(result)
    }

    /// Cancel a session and drop its queued upload if it has not started
    pub async fn cancel(&self, session_id: &str, user_id: &str) -> EngineResult<()> {
        let session = self.sessions.cancel_session(session_id, user_id).await?;
        if let Some(job_id) = session.queue_job_id.as_deref() {
            self.queue.remove_waiting(job_id)?;
        }
        Ok(())
    }

    /// Re-run the provider leg of a failed session from its assembled file
    pub async fn retry(&self, session_id: &str, user_id: &str) -> EngineResult<UploadSession> {
        let session = self.sessions.retry_session(session_id, user_id).await?;
        self.enqueue(&session)?;
        Ok(session)
    }

    fn enqueue(&self, session: &UploadSession) -> EngineResult<String> {
        let data = UploadJobData {
            session_id: session.id.clone(),
            file_id: session.file_id.clone(),
            provider_id: session.provider_id.clone(),
            assembled_file_path: self
                .sessions
                .assembled_path(&session.id)
                .to_string_lossy()
                .into_owned(),
            file_name: session.file_name.clone(),
            mime_type: session.mime_type.clone(),
            total_size: session.total_size,
        };
        let job_id = self.queue.add(&data.dedup_key(), &data)?;
        self.sessions.set_queue_job_id(&session.id, &job_id)?;
        Ok(job_id)
    }
}
