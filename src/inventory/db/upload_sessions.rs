use super::InventoryDb;
use crate::inventory::schema::upload_chunks::{self, dsl as upload_chunks_dsl};
use crate::inventory::schema::upload_sessions::{self, dsl as upload_sessions_dsl};
use crate::uploader::{UploadSession, UploadStatus};
use crate::utils::now_secs;
use anyhow::{Context, Result, anyhow};
use diesel::prelude::*;
use uuid::Uuid;

/// Outcome of recording one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// False when the chunk index had already been recorded
    pub newly_recorded: bool,
    pub received_chunks: u32,
}

impl InventoryDb {
    /// Insert a new upload session
    pub fn insert_upload_session(&self, session: &UploadSession) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::insert_into(upload_sessions::table)
            .values(&UploadSessionRow::from(session))
            .execute(&mut conn)
            .context("Failed to insert upload session")?;
        Ok(())
    }

    /// Get upload session by ID
    pub fn get_upload_session(&self, session_id: &str) -> Result<Option<UploadSession>> {
        let mut conn = self.connection()?;
        let row = upload_sessions_dsl::upload_sessions
            .filter(upload_sessions_dsl::id.eq(session_id))
            .first::<UploadSessionRow>(&mut conn)
            .optional()
            .context("Failed to query upload session")?;

        row.map(UploadSession::try_from).transpose()
    }

    /// Set status and error message. Returns false if the session is gone.
    pub fn update_upload_session_status(
        &self,
        session_id: &str,
        status: UploadStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::update(
            upload_sessions_dsl::upload_sessions.filter(upload_sessions_dsl::id.eq(session_id)),
        )
        .set((
            upload_sessions_dsl::status.eq(status.as_str()),
            upload_sessions_dsl::error_message.eq(error_message),
            upload_sessions_dsl::updated_at.eq(now_secs()),
        ))
        .execute(&mut conn)
        .context("Failed to update upload session status")?;
        Ok(affected > 0)
    }

    pub fn set_upload_session_queue_job(&self, session_id: &str, queue_job_id: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(
            upload_sessions_dsl::upload_sessions.filter(upload_sessions_dsl::id.eq(session_id)),
        )
        .set((
            upload_sessions_dsl::queue_job_id.eq(Some(queue_job_id)),
            upload_sessions_dsl::updated_at.eq(now_secs()),
        ))
        .execute(&mut conn)
        .context("Failed to store upload session queue job id")?;
        Ok(())
    }

    /// Record a received chunk. Re-recording an index is a no-op that reports
    /// the current counter, so racing writers never double count.
    pub fn record_upload_chunk(&self, session_id: &str, chunk_index: u32, size: u64) -> Result<ChunkReceipt> {
        let mut conn = self.connection()?;
        let now = now_secs();
        let chunk = UploadChunkRow {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            chunk_index: chunk_index as i32,
            size: size as i64,
            received_at: now,
        };

        let (inserted, received) = conn
            .immediate_transaction::<_, diesel::result::Error, _>(|tx_conn| {
                let inserted = diesel::insert_into(upload_chunks::table)
                    .values(&chunk)
                    .on_conflict((upload_chunks_dsl::session_id, upload_chunks_dsl::chunk_index))
                    .do_nothing()
                    .execute(tx_conn)?;

                if inserted > 0 {
                    diesel::update(
                        upload_sessions_dsl::upload_sessions
                            .filter(upload_sessions_dsl::id.eq(session_id)),
                    )
                    .set((
                        upload_sessions_dsl::received_chunks
                            .eq(upload_sessions_dsl::received_chunks + 1),
                        upload_sessions_dsl::updated_at.eq(now),
                    ))
                    .execute(tx_conn)?;
                    // First chunk flips pending to uploading
                    diesel::update(
                        upload_sessions_dsl::upload_sessions
                            .filter(upload_sessions_dsl::id.eq(session_id))
                            .filter(upload_sessions_dsl::status.eq(UploadStatus::Pending.as_str())),
                    )
                    .set(upload_sessions_dsl::status.eq(UploadStatus::Uploading.as_str()))
                    .execute(tx_conn)?;
                }

                let received = upload_sessions_dsl::upload_sessions
                    .filter(upload_sessions_dsl::id.eq(session_id))
                    .select(upload_sessions_dsl::received_chunks)
                    .first::<i32>(tx_conn)?;
                Ok((inserted > 0, received))
            })
            .context("Failed to record upload chunk")?;

        Ok(ChunkReceipt {
            newly_recorded: inserted,
            received_chunks: received.max(0) as u32,
        })
    }

    pub fn has_upload_chunk(&self, session_id: &str, chunk_index: u32) -> Result<bool> {
        let mut conn = self.connection()?;
        let count: i64 = upload_chunks_dsl::upload_chunks
            .filter(upload_chunks_dsl::session_id.eq(session_id))
            .filter(upload_chunks_dsl::chunk_index.eq(chunk_index as i32))
            .count()
            .get_result(&mut conn)
            .context("Failed to query upload chunk")?;
        Ok(count > 0)
    }

    /// Sessions owned by a user that are neither terminal nor expired
    pub fn list_active_upload_sessions(&self, user_id: &str) -> Result<Vec<UploadSession>> {
        let mut conn = self.connection()?;
        let terminal = [
            UploadStatus::Completed.as_str(),
            UploadStatus::Failed.as_str(),
            UploadStatus::Cancelled.as_str(),
        ];
        let rows = upload_sessions_dsl::upload_sessions
            .filter(upload_sessions_dsl::user_id.eq(user_id))
            .filter(upload_sessions_dsl::status.ne_all(terminal))
            .filter(upload_sessions_dsl::expires_at.gt(now_secs()))
            .order(upload_sessions_dsl::created_at.desc())
            .load::<UploadSessionRow>(&mut conn)
            .context("Failed to list active upload sessions")?;
        rows.into_iter().map(UploadSession::try_from).collect()
    }

    /// IDs of sessions whose expiry has passed
    pub fn list_expired_upload_sessions(&self, now: i64) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        upload_sessions_dsl::upload_sessions
            .filter(upload_sessions_dsl::expires_at.lt(now))
            .select(upload_sessions_dsl::id)
            .load::<String>(&mut conn)
            .context("Failed to list expired upload sessions")
    }

    /// Delete upload session. Chunk rows cascade.
    pub fn delete_upload_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(
            upload_sessions_dsl::upload_sessions.filter(upload_sessions_dsl::id.eq(session_id)),
        )
        .execute(&mut conn)
        .context("Failed to delete upload session")?;
        Ok(())
    }
}

// ===== Row Types =====

#[derive(Queryable, Insertable)]
#[diesel(table_name = upload_sessions)]
struct UploadSessionRow {
    id: String,
    file_name: String,
    mime_type: String,
    total_size: i64,
    chunk_size: i64,
    total_chunks: i32,
    received_chunks: i32,
    status: String,
    error_message: Option<String>,
    provider_id: String,
    folder_id: Option<String>,
    file_id: String,
    user_id: String,
    queue_job_id: Option<String>,
    expires_at: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = upload_chunks)]
struct UploadChunkRow {
    id: String,
    session_id: String,
    chunk_index: i32,
    size: i64,
    received_at: i64,
}

impl From<&UploadSession> for UploadSessionRow {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id.clone(),
            file_name: session.file_name.clone(),
            mime_type: session.mime_type.clone(),
            total_size: session.total_size as i64,
            chunk_size: session.chunk_size as i64,
            total_chunks: session.total_chunks as i32,
            received_chunks: session.received_chunks as i32,
            status: session.status.as_str().to_string(),
            error_message: session.error_message.clone(),
            provider_id: session.provider_id.clone(),
            folder_id: session.folder_id.clone(),
            file_id: session.file_id.clone(),
            user_id: session.user_id.clone(),
            queue_job_id: session.queue_job_id.clone(),
            expires_at: session.expires_at,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

impl TryFrom<UploadSessionRow> for UploadSession {
    type Error = anyhow::Error;

    fn try_from(row: UploadSessionRow) -> Result<Self> {
        let status = UploadStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("Unknown upload session status: {}", row.status))?;

        Ok(UploadSession {
            id: row.id,
            file_name: row.file_name,
            mime_type: row.mime_type,
            total_size: row.total_size.max(0) as u64,
            chunk_size: row.chunk_size.max(0) as u64,
            total_chunks: row.total_chunks.max(0) as u32,
            received_chunks: row.received_chunks.max(0) as u32,
            status,
            error_message: row.error_message,
            provider_id: row.provider_id,
            folder_id: row.folder_id,
            file_id: row.file_id,
            user_id: row.user_id,
            queue_job_id: row.queue_job_id,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
