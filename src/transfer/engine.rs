//! Queue handler for provider-to-provider moves.
//!
//! Source bytes are cached on local disk first, then pushed to the target,
//! then the source copy is deleted and the file record repointed. Every step
//! is checkpointed in the transfer manifest so a retried attempt resumes
//! where the last one stopped. The cancellation flag in the fast cache is
//! checked before each unit of work until the target holds the full copy;
//! a cancelled transfer aborts its remote upload and drops its scratch
//! directory.

use super::manifest::{CompletedPart, MultipartState, TransferDir, TransferManifest};
use crate::activity::{ActivityTracker, JobStatus, JobUpdate};
use crate::cache::FastCache;
use crate::error::{EngineError, EngineResult, ProviderError};
use crate::inventory::{FileNode, InventoryDb, StorageProviderRecord};
use crate::providers::{
    DeleteOptions, MultipartUpload, ProviderService, StorageProvider, UploadOptions, multipart_capable,
};
use crate::tasks::{JobContext, JobHandler, TransferJobData};
use crate::uploader::{ChunkInfo, FnProgress, ProgressStream, ProgressUpdate, plan_chunks, read_range, stream_file};
use crate::utils::now_secs;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Cache key whose presence asks a running transfer to stop
pub fn transfer_cancel_key(job_id: &str) -> String {
    format!("transfer:cancel:{}", job_id)
}

/// Overall progress, weighting the download and upload halves equally
pub fn transfer_progress(downloaded_bytes: u64, uploaded_bytes: u64, total_size: u64) -> f64 {
    if total_size == 0 {
        return 1.0;
    }
    let total = total_size as f64;
    let downloaded = (downloaded_bytes as f64 / total).clamp(0.0, 1.0);
    let uploaded = (uploaded_bytes as f64 / total).clamp(0.0, 1.0);
    (downloaded * 0.5 + uploaded * 0.5).clamp(0.0, 1.0)
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 { 100 } else { (done.min(total) * 100) / total }
}

/// Drop what an unfinished transfer left behind: the multipart upload it
/// opened on the target and the local scratch directory. Leftovers of a
/// move to another provider are not touched.
pub(crate) async fn discard_transfer(
    cache_root: &Path,
    workspace_id: &str,
    file_id: &str,
    target_provider_id: &str,
    target: Option<&dyn StorageProvider>,
) {
    let dir = TransferDir::new(cache_root, workspace_id, file_id);
    let manifest = dir.load().await;
    if manifest
        .as_ref()
        .is_some_and(|m| m.target_provider_id != target_provider_id)
    {
        return;
    }

    let pending = manifest.and_then(|m| m.multipart).filter(|m| !m.completed);
    if let (Some(pending), Some(multipart)) = (pending, target.and_then(multipart_capable)) {
        match multipart.abort_multipart_upload(&pending.upload_id, &pending.remote_id).await {
            Ok(()) => {
                tracing::debug!(target: "transfer", file_id = %file_id, upload_id = %pending.upload_id, "Aborted multipart upload");
            }
            Err(e) => {
                tracing::warn!(target: "transfer", file_id = %file_id, upload_id = %pending.upload_id, error = %e, "Failed to abort multipart upload");
            }
        }
    }
    if let Err(e) = dir.remove().await {
        tracing::warn!(target: "transfer", file_id = %file_id, error = %e, "Failed to remove transfer directory");
    }
}

/// Provider instances opened by one attempt, released when it ends
#[derive(Default)]
struct OpenedProviders {
    source: Option<Arc<dyn StorageProvider>>,
    target: Option<Arc<dyn StorageProvider>>,
}

impl OpenedProviders {
    async fn cleanup(&self) {
        for provider in self.source.iter().chain(self.target.iter()) {
            provider.cleanup().await;
        }
    }
}

pub struct TransferEngine {
    db: Arc<InventoryDb>,
    cache: Arc<FastCache>,
    activity: ActivityTracker,
    providers: ProviderService,
    cache_root: PathBuf,
    /// Checkpoint interval for downloads and part size for multipart uploads
    part_size: u64,
}

impl TransferEngine {
    pub fn new(
        db: Arc<InventoryDb>,
        cache: Arc<FastCache>,
        activity: ActivityTracker,
        providers: ProviderService,
        cache_root: PathBuf,
        part_size: u64,
    ) -> Self {
        Self {
            db,
            cache,
            activity,
            providers,
            cache_root,
            part_size: part_size.max(1),
        }
    }

    fn is_cancelled(&self, job_id: &str) -> bool {
        self.cache.exists(&transfer_cancel_key(job_id))
    }

    fn ensure_not_cancelled(&self, job_id: &str) -> EngineResult<()> {
        if self.is_cancelled(job_id) {
            return Err(EngineError::TransferCancelled);
        }
        Ok(())
    }

    fn report(&self, job_id: &str, message: impl Into<String>, manifest: &TransferManifest, phase: &str) -> EngineResult<()> {
        self.activity.update(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .message(message)
                .progress(transfer_progress(
                    manifest.downloaded_bytes,
                    manifest.uploaded_bytes,
                    manifest.total_size,
                ))
                .metadata(json!({
                    "phase": phase,
                    "downloadedBytes": manifest.downloaded_bytes,
                    "uploadedBytes": manifest.uploaded_bytes,
                    "totalSize": manifest.total_size,
                })),
        )?;
        Ok(())
    }

    async fn run(&self, ctx: &JobContext, data: &TransferJobData, opened: &mut OpenedProviders) -> EngineResult<()> {
        let job_id = data.job_id.as_str();
        if let Some(job) = self.activity.get(job_id)? {
            if job.status.is_terminal() {
                tracing::info!(target: "transfer", job_id = %job_id, status = job.status.as_str(), "Skipping finished transfer");
                return Ok(());
            }
        }

        self.activity.update(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .message("Preparing transfer")
                .metadata(json!({
                    "phase": "prepare",
                    "retryAttempt": ctx.attempts_made(),
                    "retryMax": ctx.max_attempts(),
                })),
        )?;

        let file = self
            .db
            .get_file(&data.file_id)?
            .filter(|f| !f.is_deleted && f.workspace_id == data.workspace_id)
            .ok_or_else(|| EngineError::not_found("File"))?;
        let dir = TransferDir::new(&self.cache_root, &data.workspace_id, &file.id);
        if file.provider_id == data.target_provider_id {
            // An earlier attempt repointed the file and stopped before reporting it
            if let Some(manifest) = dir
                .load()
                .await
                .filter(|m| m.source_deleted && m.target_remote_id.as_deref() == Some(file.remote_id.as_str()))
            {
                return self.finish(job_id, &file, &dir, &manifest).await;
            }
            return Err(EngineError::validation("File is already on this provider"));
        }

        let source_record = self.providers.get_provider(&file.provider_id, &data.workspace_id)?;
        let target_record = self
            .providers
            .get_provider(&data.target_provider_id, &data.workspace_id)?;
        let source = self.providers.instance(&source_record)?;
        opened.source = Some(source.clone());
        let target = self.providers.instance(&target_record)?;
        opened.target = Some(target.clone());

        dir.create().await?;
        let mut manifest = match dir.load().await {
            Some(manifest) if manifest.matches(&file, &data.target_provider_id) => {
                tracing::info!(
                    target: "transfer",
                    job_id = %job_id,
                    downloaded = manifest.downloaded_bytes,
                    uploaded = manifest.uploaded_bytes,
                    "Resuming transfer from manifest"
                );
                manifest
            }
            Some(_) => {
                tracing::warn!(target: "transfer", job_id = %job_id, "Manifest belongs to another transfer, starting over");
                TransferManifest::new(&file, &data.target_provider_id)
            }
            None => TransferManifest::new(&file, &data.target_provider_id),
        };
        dir.save(&manifest).await?;

        let final_remote_id = match manifest.target_remote_id.clone() {
            Some(remote_id) => {
                tracing::info!(target: "transfer", job_id = %job_id, remote_id = %remote_id, "Target already holds the file");
                remote_id
            }
            None => {
                self.ensure_not_cancelled(job_id)?;
                self.download(job_id, &file, source.as_ref(), &dir, &mut manifest).await?;
                self.ensure_not_cancelled(job_id)?;

                let parent_id = self.target_parent(&file, &target_record)?;
                let options = UploadOptions {
                    name: file.name.clone(),
                    mime_type: file.mime_type.clone(),
                    size: file.size,
                    parent_id,
                };
                self.report(job_id, "Uploading to target provider", &manifest, "upload")?;
                let remote_id = match multipart_capable(target.as_ref()) {
                    Some(multipart) => {
                        self.upload_multipart(job_id, multipart, &options, &dir, &mut manifest)
                            .await?
                    }
                    None => {
                        self.upload_streamed(job_id, target.as_ref(), &options, &dir, &mut manifest)
                            .await?
                    }
                };
                manifest.target_remote_id = Some(remote_id.clone());
                dir.save(&manifest).await?;
                remote_id
            }
        };

        // Once the target holds the copy, cancellation is no longer honored
        self.report(job_id, "Removing source copy", &manifest, "finalize")?;
        if !manifest.source_deleted {
            source
                .delete(&DeleteOptions {
                    remote_id: file.remote_id.clone(),
                    is_folder: false,
                })
                .await?;
            manifest.source_deleted = true;
            dir.save(&manifest).await?;
        }
        self.db
            .set_file_location(&file.id, &data.target_provider_id, &final_remote_id, now_secs())?;

        self.finish(job_id, &file, &dir, &manifest).await
    }

    async fn finish(&self, job_id: &str, file: &FileNode, dir: &TransferDir, manifest: &TransferManifest) -> EngineResult<()> {
        self.activity.complete(
            job_id,
            "Transfer completed",
            json!({
                "phase": "completed",
                "downloadedBytes": manifest.downloaded_bytes,
                "uploadedBytes": manifest.uploaded_bytes,
                "totalSize": manifest.total_size,
            }),
        )?;
        if let Err(e) = dir.remove().await {
            tracing::warn!(target: "transfer", job_id = %job_id, error = %e, "Failed to remove transfer directory");
        }
        tracing::info!(
            target: "transfer",
            job_id = %job_id,
            file_id = %file.id,
            target_provider_id = %manifest.target_provider_id,
            "Transfer completed"
        );
        Ok(())
    }

    /// Whether an earlier attempt already left a full copy on the target
    async fn upload_finished(&self, data: &TransferJobData) -> bool {
        TransferDir::new(&self.cache_root, &data.workspace_id, &data.file_id)
            .load()
            .await
            .is_some_and(|m| m.target_remote_id.is_some())
    }

    /// Fill `payload.bin` with the source bytes, resuming from the last
    /// checkpoint the payload actually covers
    async fn download(
        &self,
        job_id: &str,
        file: &FileNode,
        source: &dyn StorageProvider,
        dir: &TransferDir,
        manifest: &mut TransferManifest,
    ) -> EngineResult<()> {
        let cached = dir.payload_len().await;
        if manifest.download_complete() && cached >= manifest.total_size {
            tracing::debug!(target: "transfer", job_id = %job_id, "Source bytes already cached");
            return Ok(());
        }

        let offset = if cached >= manifest.downloaded_bytes {
            manifest.downloaded_bytes
        } else {
            0
        };
        manifest.downloaded_bytes = offset;
        self.report(job_id, "Downloading from source provider", manifest, "download")?;

        let payload_path = dir.payload_path();
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&payload_path)
            .await?;
        out.set_len(offset).await?;
        out.seek(SeekFrom::Start(offset)).await?;

        let mut stream = source.download_file_from(&file.remote_id, offset).await?;
        let mut downloaded = offset;
        loop {
            self.ensure_not_cancelled(job_id)?;
            let Some(chunk) = stream.next().await else {
                break;
            };
            let chunk = chunk
                .map_err(|e| ProviderError::with_source(source.provider_type(), "Download stream failed", e))?;
            if chunk.is_empty() {
                continue;
            }
            out.write_all(&chunk).await?;

            let before = downloaded;
            downloaded += chunk.len() as u64;
            if downloaded / self.part_size > before / self.part_size || downloaded == manifest.total_size {
                out.flush().await?;
                out.sync_data().await?;
                manifest.downloaded_bytes = downloaded;
                dir.save(manifest).await?;
                self.report(
                    job_id,
                    format!("Downloading {}%", percent(downloaded, manifest.total_size)),
                    manifest,
                    "download",
                )?;
            }
        }
        out.flush().await?;
        out.sync_data().await?;

        if downloaded != manifest.total_size {
            manifest.downloaded_bytes = if downloaded < manifest.total_size { downloaded } else { 0 };
            dir.save(manifest).await?;
            return Err(ProviderError::new(
                source.provider_type(),
                format!(
                    "Source returned {} bytes, expected {}",
                    downloaded, manifest.total_size
                ),
            )
            .into());
        }

        manifest.downloaded_bytes = downloaded;
        dir.save(manifest).await?;
        Ok(())
    }

    /// The file's folder when that folder lives on the target, else the
    /// target provider's root folder
    fn target_parent(&self, file: &FileNode, target: &StorageProviderRecord) -> EngineResult<Option<String>> {
        if let Some(folder_id) = file.folder_id.as_deref() {
            if let Some(folder) = self.db.get_folder(folder_id)? {
                if !folder.is_deleted && folder.provider_id.as_deref() == Some(target.id.as_str()) {
                    if let Some(remote_id) = folder.remote_id.filter(|id| !id.is_empty()) {
                        return Ok(Some(remote_id));
                    }
                }
            }
        }
        Ok(target.root_folder_id.clone())
    }

    /// Part-by-part upload. Parts recorded in the manifest are skipped, so a
    /// retried attempt only sends what is missing.
    async fn upload_multipart(
        &self,
        job_id: &str,
        multipart: &dyn MultipartUpload,
        options: &UploadOptions,
        dir: &TransferDir,
        manifest: &mut TransferManifest,
    ) -> EngineResult<String> {
        let existing = manifest
            .multipart
            .as_ref()
            .map(|state| (state.upload_id.clone(), state.remote_id.clone()));
        if manifest.multipart_completed() {
            if let Some((_, remote_id)) = existing {
                tracing::debug!(target: "transfer", job_id = %job_id, "Multipart upload already completed");
                return Ok(remote_id);
            }
        }
        let (upload_id, remote_id) = match existing {
            Some(ids) => ids,
            None => {
                let init = multipart.initiate_multipart_upload(options).await?;
                manifest.multipart = Some(MultipartState {
                    upload_id: init.upload_id.clone(),
                    remote_id: init.remote_id.clone(),
                    parts: Vec::new(),
                    completed: false,
                });
                manifest.uploaded_bytes = 0;
                dir.save(manifest).await?;
                (init.upload_id, init.remote_id)
            }
        };

        let mut parts = plan_chunks(manifest.total_size, self.part_size);
        if parts.is_empty() {
            parts.push(ChunkInfo {
                index: 0,
                offset: 0,
                size: 0,
            });
        }

        let payload_path = dir.payload_path();
        for part in parts {
            self.ensure_not_cancelled(job_id)?;
            if manifest.has_part(part.part_number()) {
                continue;
            }

            let bytes = read_range(&payload_path, part.offset, part.size).await?;
            let result = multipart
                .upload_part(&upload_id, &remote_id, part.part_number(), bytes)
                .await?;
            manifest.record_part(CompletedPart {
                part_number: result.part_number,
                etag: result.etag,
                size: part.size,
            });
            dir.save(manifest).await?;
            self.report(
                job_id,
                format!("Uploading {}%", percent(manifest.uploaded_bytes, manifest.total_size)),
                manifest,
                "upload",
            )?;
        }

        self.ensure_not_cancelled(job_id)?;
        multipart
            .complete_multipart_upload(&upload_id, &remote_id, &manifest.sorted_parts())
            .await?;
        if let Some(state) = manifest.multipart.as_mut() {
            state.completed = true;
        }
        manifest.uploaded_bytes = manifest.total_size;
        dir.save(manifest).await?;
        Ok(remote_id)
    }

    /// Single streamed upload. It cannot resume mid-stream, so a retry sends
    /// the whole cached payload again.
    async fn upload_streamed(
        &self,
        job_id: &str,
        target: &dyn StorageProvider,
        options: &UploadOptions,
        dir: &TransferDir,
        manifest: &mut TransferManifest,
    ) -> EngineResult<String> {
        let response = target.request_upload(options).await?;
        manifest.uploaded_bytes = 0;

        let activity = self.activity.clone();
        let progress_job = job_id.to_string();
        let downloaded = manifest.downloaded_bytes;
        let callback = Arc::new(FnProgress(move |update: ProgressUpdate| {
            let result = activity.update(
                &progress_job,
                JobUpdate::new()
                    .message(format!("Uploading {}%", percent(update.transferred, update.total_size)))
                    .progress(transfer_progress(downloaded, update.transferred, update.total_size))
                    .metadata(json!({
                        "phase": "upload",
                        "downloadedBytes": downloaded,
                        "uploadedBytes": update.transferred,
                        "totalSize": update.total_size,
                    })),
            );
            if let Err(e) = result {
                tracing::debug!(target: "transfer", job_id = %progress_job, error = %e, "Failed to publish upload progress");
            }
        }));

        self.ensure_not_cancelled(job_id)?;
        let stream = ProgressStream::new(
            stream_file(&dir.payload_path()).await?,
            manifest.total_size,
            self.part_size,
            callback,
        );
        let returned = target.upload_file(&response.file_id, Box::pin(stream)).await?;

        manifest.uploaded_bytes = manifest.total_size;
        dir.save(manifest).await?;
        Ok(returned
            .filter(|id| !id.is_empty())
            .unwrap_or(response.file_id))
    }
}

#[async_trait]
impl JobHandler for TransferEngine {
    async fn handle(&self, ctx: &JobContext) -> EngineResult<()> {
        let data: TransferJobData = ctx.payload()?;
        tracing::info!(
            target: "transfer",
            job_id = %data.job_id,
            file_id = %data.file_id,
            target_provider_id = %data.target_provider_id,
            attempt = ctx.attempts_made(),
            "Transfer worker processing job"
        );

        let mut opened = OpenedProviders::default();
        let mut result = self.run(ctx, &data, &mut opened).await;
        // A failure racing a cancel request still ends as a cancellation,
        // unless the target already holds the copy
        if result.is_err() && self.is_cancelled(&data.job_id) && !self.upload_finished(&data).await {
            result = Err(EngineError::TransferCancelled);
        }
        if matches!(result, Err(EngineError::TransferCancelled)) {
            discard_transfer(
                &self.cache_root,
                &data.workspace_id,
                &data.file_id,
                &data.target_provider_id,
                opened.target.as_deref(),
            )
            .await;
        }
        opened.cleanup().await;
        self.cache.del(&transfer_cancel_key(&data.job_id));

        match result {
            Ok(()) => Ok(()),
            Err(EngineError::TransferCancelled) => {
                tracing::info!(target: "transfer", job_id = %data.job_id, "Transfer cancelled");
                self.activity.cancel(&data.job_id, "Transfer cancelled")?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    target: "transfer",
                    job_id = %data.job_id,
                    file_id = %data.file_id,
                    error = %e,
                    "Provider transfer job failed"
                );
                Err(e)
            }
        }
    }

    async fn on_failed(&self, ctx: &JobContext, error: &EngineError, will_retry: bool) {
        let Ok(data) = ctx.payload::<TransferJobData>() else {
            return;
        };
        if let Err(e) = self.activity.record_attempt_failure(
            &data.job_id,
            error,
            ctx.attempts_made(),
            ctx.max_attempts(),
            will_retry,
        ) {
            tracing::warn!(target: "transfer", job_id = %data.job_id, error = %e, "Failed to record transfer failure");
        }
    }
}
