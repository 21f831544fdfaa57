//! Queue handler that moves an assembled upload from local scratch to its
//! target provider.

use super::chunk::{plan_chunks, read_range, stream_file};
use super::progress::{FnProgress, ProgressStream, ProgressUpdate};
use super::session::{UploadSession, UploadSessionManager, UploadStatus};
use crate::error::{EngineError, EngineResult};
use crate::inventory::{InventoryDb, StorageProviderRecord};
use crate::providers::{
    MultipartUpload, ProviderService, StorageProvider, UploadOptions, UploadPartResult, multipart_capable,
    remote_basename, remote_parent_id,
};
use crate::tasks::{JobContext, JobHandler, UploadJobData};
use crate::utils::now_secs;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub struct UploadWorker {
    db: Arc<InventoryDb>,
    sessions: Arc<UploadSessionManager>,
    providers: ProviderService,
    progress_interval: u64,
}

impl UploadWorker {
    pub fn new(
        db: Arc<InventoryDb>,
        sessions: Arc<UploadSessionManager>,
        providers: ProviderService,
        progress_interval: u64,
    ) -> Self {
        Self {
            db,
            sessions,
            providers,
            progress_interval,
        }
    }

    async fn send_to_provider(
        &self,
        data: &UploadJobData,
        session: &UploadSession,
        record: &StorageProviderRecord,
        provider: &dyn StorageProvider,
    ) -> EngineResult<()> {
        let path = Path::new(&data.assembled_file_path);
        match multipart_capable(provider) {
            Some(multipart) => self.send_multipart(data, session, record, multipart, path).await,
            None => self.send_streamed(data, provider, path).await,
        }
    }

    /// Parent and name the catalog reserved for the file. A record without a
    /// remote id falls back to the session folder when it lives on this
    /// provider, else the provider root.
    fn reserved_location(
        &self,
        data: &UploadJobData,
        session: &UploadSession,
        record: &StorageProviderRecord,
    ) -> EngineResult<(Option<String>, String)> {
        if let Some(file) = self.db.get_file(&data.file_id)? {
            if !file.remote_id.is_empty() {
                return Ok((
                    remote_parent_id(&file.remote_id),
                    remote_basename(&file.remote_id).to_string(),
                ));
            }
        }
        let folder_remote_id = match session.folder_id.as_deref() {
            Some(folder_id) => self
                .db
                .get_folder(folder_id)?
                .filter(|f| !f.is_deleted && f.provider_id.as_deref() == Some(record.id.as_str()))
                .and_then(|f| f.remote_id)
                .filter(|id| !id.is_empty()),
            None => None,
        };
        Ok((
            folder_remote_id.or_else(|| record.root_folder_id.clone()),
            data.file_name.clone(),
        ))
    }

    /// Part-by-part upload, one part per session chunk
    async fn send_multipart(
        &self,
        data: &UploadJobData,
        session: &UploadSession,
        record: &StorageProviderRecord,
        multipart: &dyn MultipartUpload,
        path: &Path,
    ) -> EngineResult<()> {
        let (parent_id, name) = self.reserved_location(data, session, record)?;
        let init = multipart
            .initiate_multipart_upload(&UploadOptions {
                name,
                mime_type: data.mime_type.clone(),
                size: data.total_size,
                parent_id,
            })
            .await?;

        let result: EngineResult<Vec<UploadPartResult>> = async {
            let mut parts = Vec::new();
            let mut sent = 0u64;
            for chunk in plan_chunks(data.total_size, session.chunk_size) {
                let bytes = read_range(path, chunk.offset, chunk.size).await?;
                let part = multipart
                    .upload_part(&init.upload_id, &init.remote_id, chunk.part_number(), bytes)
                    .await?;
                parts.push(part);
                sent += chunk.size;
                self.sessions.update_provider_progress(&data.session_id, sent, None)?;
            }
            parts.sort_by_key(|p| p.part_number);
            Ok(parts)
        }
        .await;

        let parts = match result {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = multipart
                    .abort_multipart_upload(&init.upload_id, &init.remote_id)
                    .await
                {
                    tracing::warn!(target: "uploader", session_id = %data.session_id, error = %abort, "Failed to abort multipart upload");
                }
                return Err(e);
            }
        };

        multipart
            .complete_multipart_upload(&init.upload_id, &init.remote_id, &parts)
            .await?;
        self.db
            .set_file_location(&data.file_id, &data.provider_id, &init.remote_id, now_secs())?;
        Ok(())
    }

    /// Single streamed upload through a byte counter
    async fn send_streamed(&self, data: &UploadJobData, provider: &dyn StorageProvider, path: &Path) -> EngineResult<()> {
        let file = self
            .db
            .get_file(&data.file_id)?
            .ok_or_else(|| EngineError::not_found("File"))?;
        if file.remote_id.is_empty() {
            return Err(EngineError::validation("File record has no remote id"));
        }

        let sessions = self.sessions.clone();
        let session_id = data.session_id.clone();
        let callback = Arc::new(FnProgress(move |update: ProgressUpdate| {
            if let Err(e) = sessions.update_provider_progress(&session_id, update.transferred, None) {
                tracing::debug!(target: "uploader", session_id = %session_id, error = %e, "Failed to record provider progress");
            }
        }));
        let stream = ProgressStream::new(stream_file(path).await?, data.total_size, self.progress_interval, callback);

        let new_remote_id = provider.upload_file(&file.remote_id, Box::pin(stream)).await?;
        if let Some(new_remote_id) = new_remote_id.filter(|id| *id != file.remote_id) {
            self.db
                .set_file_location(&file.id, &data.provider_id, &new_remote_id, now_secs())?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for UploadWorker {
    async fn handle(&self, ctx: &JobContext) -> EngineResult<()> {
        let data: UploadJobData = ctx.payload()?;
        let session = self.sessions.load_session(&data.session_id)?;
        if matches!(session.status, UploadStatus::Cancelled | UploadStatus::Completed) {
            tracing::info!(
                target: "uploader",
                session_id = %data.session_id,
                status = session.status.as_str(),
                "Skipping upload for finished session"
            );
            return Ok(());
        }

        tracing::info!(
            target: "uploader",
            job_id = %ctx.id(),
            session_id = %data.session_id,
            provider_id = %data.provider_id,
            attempt = ctx.attempts_made(),
            "Upload worker processing job"
        );

        let result = async {
            self.sessions
                .update_provider_progress(&data.session_id, 0, Some(UploadStatus::Transferring))?;
            let record = self.providers.get_provider_unchecked(&data.provider_id)?;
            let provider = self.providers.instance(&record)?;
            let sent = self.send_to_provider(&data, &session, &record, provider.as_ref()).await;
            provider.cleanup().await;
            sent
        }
        .await;

        // A cancel that arrived mid-flight keeps the session cancelled
        if self.sessions.load_session(&data.session_id)?.status == UploadStatus::Cancelled {
            tracing::info!(
                target: "uploader",
                session_id = %data.session_id,
                sent = result.is_ok(),
                "Upload session was cancelled during the provider leg"
            );
            return Ok(());
        }

        match result {
            Ok(()) => {
                self.sessions.mark_completed(&data.session_id).await?;
                tracing::info!(target: "uploader", session_id = %data.session_id, "Upload worker completed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(target: "uploader", session_id = %data.session_id, error = %e, "Upload worker failed");
                self.sessions.mark_failed(&data.session_id, &e.to_string())?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::FileNode;
    use crate::inventory::test_support::provider_record;
    use crate::providers::memory::{MemoryProvider, registry_with};
    use crate::tasks::{QueueJob, QueueJobStatus};
    use crate::uploader::session::test_support::{fixture, params};
    use bytes::Bytes;

    fn file_node(remote_id: &str) -> FileNode {
        FileNode {
            id: "f1".into(),
            workspace_id: "ws".into(),
            virtual_path: "/video.mp4".into(),
            name: "video.mp4".into(),
            mime_type: "video/mp4".into(),
            size: 10,
            hash: None,
            remote_id: remote_id.into(),
            provider_id: "p1".into(),
            folder_id: None,
            uploaded_by: "alice".into(),
            is_deleted: false,
            starred: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    async fn assembled_session(fx: &crate::uploader::session::test_support::SessionFixture) -> UploadJobData {
        let id = fx.manager.create_session(params(10, 4)).await.unwrap().session_id;
        for (i, chunk) in [&b"abcd"[..], b"efgh", b"ij"].iter().enumerate() {
            fx.manager
                .receive_chunk(&id, i as u32, Bytes::copy_from_slice(chunk), "alice")
                .await
                .unwrap();
        }
        let path = fx.manager.assemble_chunks(&id).await.unwrap();
        UploadJobData {
            session_id: id,
            file_id: "f1".into(),
            provider_id: "p1".into(),
            assembled_file_path: path.to_string_lossy().into_owned(),
            file_name: "video.mp4".into(),
            mime_type: "video/mp4".into(),
            total_size: 10,
        }
    }

    fn context(data: &UploadJobData) -> JobContext {
        JobContext::new(QueueJob {
            id: data.dedup_key(),
            queue: "uploads".into(),
            payload: serde_json::to_value(data).unwrap(),
            status: QueueJobStatus::Active,
            attempts_made: 1,
            max_attempts: 3,
            run_at: 0,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        })
    }

    #[tokio::test]
    async fn test_multipart_upload_sends_parts_in_order() {
        let fx = fixture();
        let provider = Arc::new(MemoryProvider::new(true));
        fx.db.insert_provider(&provider_record("p1", "ws", "memory")).unwrap();
        fx.db.insert_file(&file_node("")).unwrap();
        let providers = ProviderService::new(fx.db.clone(), Arc::new(registry_with(&[("memory", provider.clone())])));
        let worker = UploadWorker::new(fx.db.clone(), fx.manager.clone(), providers, 1024);

        let data = assembled_session(&fx).await;
        worker.handle(&context(&data)).await.unwrap();

        assert_eq!(provider.uploaded_parts(), vec![1, 2, 3]);
        assert_eq!(provider.completions(), vec![vec![1, 2, 3]]);
        assert_eq!(provider.file("video.mp4").unwrap(), b"abcdefghij");
        assert_eq!(fx.db.get_file("f1").unwrap().unwrap().remote_id, "video.mp4");

        let session = fx.db.get_upload_session(&data.session_id).unwrap().unwrap();
        assert_eq!(session.status, UploadStatus::Completed);
        assert!(!Path::new(&data.assembled_file_path).exists());
        assert_eq!(provider.cleanups(), 1);
    }

    #[tokio::test]
    async fn test_multipart_upload_lands_at_reserved_path() {
        let fx = fixture();
        let provider = Arc::new(MemoryProvider::new(true));
        provider.put("video.mp4", b"ORIGINAL");
        fx.db.insert_provider(&provider_record("p1", "ws", "memory")).unwrap();
        fx.db.insert_file(&file_node("docs/video.mp4")).unwrap();
        let providers = ProviderService::new(fx.db.clone(), Arc::new(registry_with(&[("memory", provider.clone())])));
        let worker = UploadWorker::new(fx.db.clone(), fx.manager.clone(), providers, 1024);

        let data = assembled_session(&fx).await;
        worker.handle(&context(&data)).await.unwrap();

        assert_eq!(provider.file("docs/video.mp4").unwrap(), b"abcdefghij");
        assert_eq!(provider.file("video.mp4").unwrap(), b"ORIGINAL");
        assert_eq!(fx.db.get_file("f1").unwrap().unwrap().remote_id, "docs/video.mp4");
    }

    #[tokio::test]
    async fn test_cancel_during_provider_leg_keeps_session_cancelled() {
        let fx = fixture();
        let provider = Arc::new(MemoryProvider::new(false));
        fx.db.insert_provider(&provider_record("p1", "ws", "memory")).unwrap();
        fx.db.insert_file(&file_node("video.mp4")).unwrap();
        let providers = ProviderService::new(fx.db.clone(), Arc::new(registry_with(&[("memory", provider.clone())])));
        let worker = UploadWorker::new(fx.db.clone(), fx.manager.clone(), providers, 1024);
        let data = assembled_session(&fx).await;

        let db = fx.db.clone();
        let session_id = data.session_id.clone();
        provider.on_upload(move || {
            db.update_upload_session_status(&session_id, UploadStatus::Cancelled, None)
                .unwrap();
        });
        worker.handle(&context(&data)).await.unwrap();

        let session = fx.db.get_upload_session(&data.session_id).unwrap().unwrap();
        assert_eq!(session.status, UploadStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_streamed_upload_and_failure_keeps_assembled_file() {
        let fx = fixture();
        let provider = Arc::new(MemoryProvider::new(false));
        fx.db.insert_provider(&provider_record("p1", "ws", "memory")).unwrap();
        fx.db.insert_file(&file_node("uploads/video.mp4")).unwrap();
        let providers = ProviderService::new(fx.db.clone(), Arc::new(registry_with(&[("memory", provider.clone())])));
        let worker = UploadWorker::new(fx.db.clone(), fx.manager.clone(), providers, 4);
        let data = assembled_session(&fx).await;

        provider.fail_next_uploads(1);
        let err = worker.handle(&context(&data)).await.unwrap_err();
        assert!(err.is_retryable());
        let session = fx.db.get_upload_session(&data.session_id).unwrap().unwrap();
        assert_eq!(session.status, UploadStatus::Failed);
        assert!(Path::new(&data.assembled_file_path).exists());

        worker.handle(&context(&data)).await.unwrap();
        assert_eq!(provider.file("uploads/video.mp4").unwrap(), b"abcdefghij");
        assert!(provider.uploaded_parts().is_empty());
        let state = fx.manager.get_session_state(&data.session_id).unwrap().unwrap();
        assert_eq!(state.status, UploadStatus::Completed);
        assert_eq!(state.provider_bytes_transferred, 10);
    }
}
