//! Chunked upload session lifecycle.
//!
//! The database row is the source of truth; a compact [`UploadSessionState`]
//! is mirrored into the fast cache for progress reads. Chunk bytes live in a
//! per-session scratch directory until the session completes or expires.

use super::chunk::{chunk_count, expected_chunk_size};
use crate::activity::ActivityTracker;
use crate::cache::FastCache;
use crate::error::{EngineError, EngineResult};
use crate::inventory::InventoryDb;
use crate::utils::now_secs;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const ASSEMBLED_FILE: &str = "assembled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Assembling,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Assembling => "assembling",
            UploadStatus::Transferring => "transferring",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(UploadStatus::Pending),
            "uploading" => Some(UploadStatus::Uploading),
            "assembling" => Some(UploadStatus::Assembling),
            "transferring" => Some(UploadStatus::Transferring),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            "cancelled" => Some(UploadStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

/// Which leg of the upload the bytes are on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    ClientToServer,
    ServerToProvider,
}

/// Persisted upload session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub provider_id: String,
    pub folder_id: Option<String>,
    pub file_id: String,
    pub user_id: String,
    pub queue_job_id: Option<String>,
    pub expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UploadSession {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Real-time view of a session, as mirrored in the cache and published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionState {
    pub session_id: String,
    pub status: UploadStatus,
    pub phase: UploadPhase,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub provider_bytes_transferred: u64,
    pub total_size: u64,
    pub error_message: Option<String>,
}

impl From<&UploadSession> for UploadSessionState {
    fn from(session: &UploadSession) -> Self {
        let on_provider_leg = matches!(
            session.status,
            UploadStatus::Transferring | UploadStatus::Completed
        );
        Self {
            session_id: session.id.clone(),
            status: session.status,
            phase: if on_provider_leg {
                UploadPhase::ServerToProvider
            } else {
                UploadPhase::ClientToServer
            },
            received_chunks: session.received_chunks,
            total_chunks: session.total_chunks,
            provider_bytes_transferred: if session.status == UploadStatus::Completed {
                session.total_size
            } else {
                0
            },
            total_size: session.total_size,
            error_message: session.error_message.clone(),
        }
    }
}

/// A user's in-flight session, with the live state merged in
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUpload {
    #[serde(flatten)]
    pub state: UploadSessionState,
    pub file_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    /// Falls back to the configured default
    pub chunk_size: Option<u64>,
    pub provider_id: String,
    pub folder_id: Option<String>,
    pub user_id: String,
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveChunkResult {
    pub is_complete: bool,
    pub chunk_index: u32,
    /// Every chunk is in but the session was never assembled
    #[serde(skip)]
    pub needs_assembly: bool,
}

pub struct UploadSessionManager {
    db: Arc<InventoryDb>,
    cache: Arc<FastCache>,
    activity: ActivityTracker,
    temp_dir: PathBuf,
    default_chunk_size: u64,
    session_ttl: Duration,
}

impl UploadSessionManager {
    pub fn new(
        db: Arc<InventoryDb>,
        cache: Arc<FastCache>,
        activity: ActivityTracker,
        temp_dir: PathBuf,
        default_chunk_size: u64,
        session_ttl: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            activity,
            temp_dir,
            default_chunk_size,
            session_ttl,
        }
    }

    fn cache_key(session_id: &str) -> String {
        format!("upload:session:{}", session_id)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.temp_dir.join(session_id)
    }

    fn chunk_path(&self, session_id: &str, chunk_index: u32) -> PathBuf {
        self.session_dir(session_id).join(format!("chunk-{}", chunk_index))
    }

    /// Where `assemble_chunks` puts the concatenated file
    pub fn assembled_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(ASSEMBLED_FILE)
    }

    /// Create a session for a file of at least one full chunk
    pub async fn create_session(&self, params: CreateSessionParams) -> EngineResult<CreatedSession> {
        let chunk_size = params.chunk_size.unwrap_or(self.default_chunk_size);
        if chunk_size == 0 {
            return Err(EngineError::validation("Chunk size must be positive"));
        }
        if params.total_size == 0 || params.total_size < chunk_size {
            return Err(EngineError::validation("File too small for chunked upload"));
        }
        let total_chunks = chunk_count(params.total_size, chunk_size)
            .ok_or_else(|| EngineError::validation("File has too many chunks"))?;

        let session_id = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(self.session_dir(&session_id)).await?;

        let now = now_secs();
        let session = UploadSession {
            id: session_id.clone(),
            file_name: params.file_name,
            mime_type: params.mime_type,
            total_size: params.total_size,
            chunk_size,
            total_chunks,
            received_chunks: 0,
            status: UploadStatus::Pending,
            error_message: None,
            provider_id: params.provider_id,
            folder_id: params.folder_id,
            file_id: params.file_id,
            user_id: params.user_id,
            queue_job_id: None,
            expires_at: now + self.session_ttl.as_secs() as i64,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_upload_session(&session)?;
        self.write_mirror(&session, &UploadSessionState::from(&session));

        tracing::debug!(
            target: "uploader::session",
            session_id = %session_id,
            total_chunks,
            chunk_size,
            total_size = session.total_size,
            "Upload session created"
        );

        Ok(CreatedSession {
            session_id,
            total_chunks,
            chunk_size,
        })
    }

    /// Session owned by `user_id`. Anyone else's session is reported missing.
    pub fn get_session(&self, session_id: &str, user_id: &str) -> EngineResult<UploadSession> {
        self.db
            .get_upload_session(session_id)?
            .filter(|session| session.user_id == user_id)
            .ok_or_else(|| EngineError::not_found("Upload session"))
    }

    /// Session by id alone, for background workers
    pub fn load_session(&self, session_id: &str) -> EngineResult<UploadSession> {
        self.db
            .get_upload_session(session_id)?
            .ok_or_else(|| EngineError::not_found("Upload session"))
    }

    /// Store one chunk. Re-sending an index that is already recorded changes
    /// nothing and reports the current completion.
    pub async fn receive_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
        user_id: &str,
    ) -> EngineResult<ReceiveChunkResult> {
        let session = self.get_session(session_id, user_id)?;

        if matches!(session.status, UploadStatus::Cancelled | UploadStatus::Failed) {
            return Err(EngineError::validation(format!(
                "Upload session is {}",
                session.status.as_str()
            )));
        }
        if session.is_expired(now_secs()) {
            return Err(EngineError::validation("Upload session has expired"));
        }
        if chunk_index >= session.total_chunks {
            return Err(EngineError::validation(format!(
                "Invalid chunk index {}. Expected 0-{}",
                chunk_index,
                session.total_chunks - 1
            )));
        }

        if self.db.has_upload_chunk(session_id, chunk_index)? {
            let is_complete = session.received_chunks >= session.total_chunks;
            return Ok(ReceiveChunkResult {
                is_complete,
                chunk_index,
                needs_assembly: is_complete
                    && matches!(session.status, UploadStatus::Pending | UploadStatus::Uploading),
            });
        }

        let expected = expected_chunk_size(session.total_size, session.chunk_size, chunk_index);
        if data.len() as u64 != expected {
            return Err(EngineError::validation(format!(
                "Chunk {} has {} bytes, expected {}",
                chunk_index,
                data.len(),
                expected
            )));
        }

        self.write_chunk(session_id, chunk_index, &data).await?;
        let receipt = self
            .db
            .record_upload_chunk(session_id, chunk_index, data.len() as u64)?;

        let is_complete = receipt.received_chunks >= session.total_chunks;
        if receipt.newly_recorded {
            self.update_mirror(&session, |state| {
                state.received_chunks = receipt.received_chunks;
                state.status = UploadStatus::Uploading;
            });
        }

        tracing::debug!(
            target: "uploader::session",
            session_id = %session_id,
            chunk_index,
            received_chunks = receipt.received_chunks,
            total_chunks = session.total_chunks,
            is_complete,
            "Chunk received"
        );

        Ok(ReceiveChunkResult {
            is_complete,
            chunk_index,
            // Only the writer whose increment completed the set assembles
            needs_assembly: receipt.newly_recorded && receipt.received_chunks == session.total_chunks,
        })
    }

    async fn write_chunk(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> EngineResult<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".chunk-{}.{}.partial", chunk_index, Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.chunk_path(session_id, chunk_index)).await?;
        Ok(())
    }

    /// Concatenate chunks `0..total_chunks` in order into one file
    pub async fn assemble_chunks(&self, session_id: &str) -> EngineResult<PathBuf> {
        let session = self.load_session(session_id)?;
        self.set_status(&session, UploadStatus::Assembling, None)?;

        let assembled = self.assembled_path(session_id);
        let tmp = assembled.with_extension("partial");
        let result = match self.concat_chunks(&session, &tmp).await {
            Ok(()) => fs::rename(&tmp, &assembled).await.map_err(EngineError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            // A cancelled session keeps its status
            if self.load_session(session_id)?.status != UploadStatus::Cancelled {
                self.mark_failed(session_id, &e.to_string())?;
            }
            return Err(e);
        }

        tracing::debug!(
            target: "uploader::session",
            session_id = %session_id,
            path = %assembled.display(),
            total_chunks = session.total_chunks,
            "Chunks assembled"
        );
        Ok(assembled)
    }

    async fn concat_chunks(&self, session: &UploadSession, target: &Path) -> EngineResult<()> {
        let mut out = fs::File::create(target).await?;
        let mut written = 0u64;
        for index in 0..session.total_chunks {
            // A cancel lands between chunks
            if self.load_session(&session.id)?.status == UploadStatus::Cancelled {
                return Err(EngineError::validation("Upload session is cancelled"));
            }
            let mut chunk = fs::File::open(self.chunk_path(&session.id, index))
                .await
                .map_err(|e| EngineError::validation(format!("Chunk {} is missing: {}", index, e)))?;
            written += tokio::io::copy(&mut chunk, &mut out).await?;
        }
        out.sync_all().await?;

        if written != session.total_size {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "Assembled {} bytes, expected {}",
                written,
                session.total_size
            )));
        }
        Ok(())
    }

    /// Record bytes sent to the provider and optionally move the status.
    /// Only a status change touches the database.
    pub fn update_provider_progress(
        &self,
        session_id: &str,
        bytes_transferred: u64,
        status: Option<UploadStatus>,
    ) -> EngineResult<UploadSessionState> {
        let session = self.load_session(session_id)?;
        if let Some(status) = status {
            self.db.update_upload_session_status(session_id, status, None)?;
        }
        Ok(self.update_mirror(&session, |state| {
            state.provider_bytes_transferred = bytes_transferred;
            state.phase = UploadPhase::ServerToProvider;
            if let Some(status) = status {
                state.status = status;
                state.error_message = None;
            }
        }))
    }

    /// Mark the provider leg done and drop the scratch directory
    pub async fn mark_completed(&self, session_id: &str) -> EngineResult<()> {
        let session = self.load_session(session_id)?;
        self.db
            .update_upload_session_status(session_id, UploadStatus::Completed, None)?;
        self.update_mirror(&session, |state| {
            state.status = UploadStatus::Completed;
            state.phase = UploadPhase::ServerToProvider;
            state.provider_bytes_transferred = session.total_size;
            state.error_message = None;
        });
        self.remove_session_files(session_id).await;
        tracing::info!(target: "uploader::session", session_id = %session_id, "Upload session completed");
        Ok(())
    }

    /// Scratch files are kept so the session can be retried
    pub fn mark_failed(&self, session_id: &str, message: &str) -> EngineResult<()> {
        let session = self.load_session(session_id)?;
        self.set_status(&session, UploadStatus::Failed, Some(message))?;
        tracing::warn!(target: "uploader::session", session_id = %session_id, error = %message, "Upload session failed");
        Ok(())
    }

    pub fn set_queue_job_id(&self, session_id: &str, job_id: &str) -> EngineResult<()> {
        Ok(self.db.set_upload_session_queue_job(session_id, job_id)?)
    }

    pub async fn cancel_session(&self, session_id: &str, user_id: &str) -> EngineResult<UploadSession> {
        let session = self.get_session(session_id, user_id)?;
        if session.status.is_terminal() {
            return Err(EngineError::validation(format!(
                "Upload session is already {}",
                session.status.as_str()
            )));
        }
        self.set_status(&session, UploadStatus::Cancelled, None)?;
        self.remove_session_files(session_id).await;
        tracing::debug!(target: "uploader::session", session_id = %session_id, "Upload session cancelled");
        Ok(session)
    }

    /// Reset a failed session whose assembled file survived so it can be
    /// handed to the upload worker again
    pub async fn retry_session(&self, session_id: &str, user_id: &str) -> EngineResult<UploadSession> {
        let mut session = self.get_session(session_id, user_id)?;
        if session.status != UploadStatus::Failed {
            return Err(EngineError::validation(format!(
                "Only failed uploads can be retried, this one is {}",
                session.status.as_str()
            )));
        }
        if fs::metadata(self.assembled_path(session_id)).await.is_err() {
            return Err(EngineError::validation(
                "Assembled file is gone, the upload has to start over",
            ));
        }

        self.db
            .update_upload_session_status(session_id, UploadStatus::Transferring, None)?;
        self.update_mirror(&session, |state| {
            state.status = UploadStatus::Transferring;
            state.phase = UploadPhase::ServerToProvider;
            state.provider_bytes_transferred = 0;
            state.error_message = None;
        });
        session.status = UploadStatus::Transferring;
        session.error_message = None;
        tracing::info!(target: "uploader::session", session_id = %session_id, "Upload session retried");
        Ok(session)
    }

    /// Live state: the cache mirror when present, the database otherwise
    pub fn get_session_state(&self, session_id: &str) -> EngineResult<Option<UploadSessionState>> {
        if let Some(state) = self.cache.get_json::<UploadSessionState>(&Self::cache_key(session_id)) {
            return Ok(Some(state));
        }
        Ok(self
            .db
            .get_upload_session(session_id)?
            .map(|session| UploadSessionState::from(&session)))
    }

    pub fn get_active_sessions_for_user(&self, user_id: &str) -> EngineResult<Vec<ActiveUpload>> {
        let sessions = self.db.list_active_upload_sessions(user_id)?;
        Ok(sessions
            .into_iter()
            .map(|session| {
                let state = self
                    .cache
                    .get_json::<UploadSessionState>(&Self::cache_key(&session.id))
                    .unwrap_or_else(|| UploadSessionState::from(&session));
                ActiveUpload {
                    state,
                    file_name: session.file_name,
                    created_at: session.created_at,
                }
            })
            .collect())
    }

    /// Drop sessions past their expiry along with their files and mirrors
    pub async fn cleanup_expired_sessions(&self) -> EngineResult<usize> {
        let expired = self.db.list_expired_upload_sessions(now_secs())?;
        for session_id in &expired {
            self.remove_session_files(session_id).await;
            self.cache.del(&Self::cache_key(session_id));
            self.db.delete_upload_session(session_id)?;
        }
        if !expired.is_empty() {
            tracing::info!(target: "uploader::session", count = expired.len(), "Cleaned up expired upload sessions");
        }
        Ok(expired.len())
    }

    fn set_status(&self, session: &UploadSession, status: UploadStatus, error_message: Option<&str>) -> EngineResult<()> {
        self.db
            .update_upload_session_status(&session.id, status, error_message)?;
        self.update_mirror(session, |state| {
            state.status = status;
            state.error_message = error_message.map(str::to_string);
        });
        Ok(())
    }

    /// Apply a change to the mirrored state, rebuilding it from the session
    /// on a cache miss, then store and publish it
    fn update_mirror<F>(&self, session: &UploadSession, apply: F) -> UploadSessionState
    where
        F: FnOnce(&mut UploadSessionState),
    {
        let mut state = self
            .cache
            .get_json::<UploadSessionState>(&Self::cache_key(&session.id))
            .unwrap_or_else(|| UploadSessionState::from(session));
        apply(&mut state);
        self.write_mirror(session, &state);
        state
    }

    fn write_mirror(&self, session: &UploadSession, state: &UploadSessionState) {
        let remaining = (session.expires_at - now_secs()).max(1) as u64;
        if let Err(e) = self
            .cache
            .set_json_ex(Self::cache_key(&session.id), state, Duration::from_secs(remaining))
        {
            tracing::warn!(target: "uploader::session", session_id = %session.id, error = %e, "Failed to mirror session state");
        }
        self.activity.publish_upload_progress(state.clone());
    }

    async fn remove_session_files(&self, session_id: &str) {
        let dir = self.session_dir(session_id);
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(target: "uploader::session", session_id = %session_id, error = %e, "Failed to remove session files");
            }
        }
    }
}
