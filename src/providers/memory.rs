//! In-memory provider for tests. Records every call that matters to the
//! transfer and upload protocols so tests can assert on them.

use super::{
    AuthType, ByteStream, CopyOptions, CreateFolderOptions, DeleteOptions, DownloadResponse, FileMetadata,
    FolderMetadata, ListOptions, ListResult, MoveOptions, MultipartUpload, MultipartUploadInit, ProviderCapabilities,
    ProviderQuota, ProviderRegistration, ProviderRegistry, StorageProvider, UploadOptions, UploadPartResult,
    UploadResponse, child_remote_id, collect_bytes, remote_basename, remote_parent_id,
};
use crate::crypto::ConfigCipher;
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

pub const PROVIDER_TYPE: &str = "memory";

/// Registry whose types each resolve to one shared in-memory instance
pub fn registry_with(providers: &[(&str, Arc<MemoryProvider>)]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new(ConfigCipher::new("secret"));
    for (provider_type, provider) in providers {
        let provider = provider.clone();
        registry.register(ProviderRegistration {
            provider_type: provider_type.to_string(),
            description: "In-memory test provider".into(),
            supports_presigned_urls: false,
            auth_type: AuthType::NoAuth,
            config_fields: vec![],
            factory: Arc::new(move |_| Ok(provider.clone() as Arc<dyn StorageProvider>)),
        });
    }
    registry
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    folders: BTreeSet<String>,
    /// upload id -> part number -> bytes
    pending_parts: BTreeMap<String, BTreeMap<u32, Vec<u8>>>,
    uploaded_parts: Vec<u32>,
    completed_with: Vec<Vec<u32>>,
    aborted: Vec<String>,
    deleted: Vec<String>,
    cleanups: u32,
}

pub struct MemoryProvider {
    multipart: bool,
    state: Mutex<State>,
    /// Fail the next N `upload_part`/`upload_file` calls
    upload_failures: AtomicU32,
    delete_failures: AtomicU32,
    /// Runs at the start of every `upload_part`/`upload_file` call
    upload_hook: Mutex<Option<UploadHook>>,
}

type UploadHook = Arc<dyn Fn() + Send + Sync>;

impl MemoryProvider {
    pub fn new(multipart: bool) -> Self {
        Self {
            multipart,
            state: Mutex::new(State::default()),
            upload_failures: AtomicU32::new(0),
            delete_failures: AtomicU32::new(0),
            upload_hook: Mutex::new(None),
        }
    }

    pub fn put(&self, remote_id: &str, data: &[u8]) {
        self.state.lock().unwrap().files.insert(remote_id.to_string(), data.to_vec());
    }

    pub fn put_folder(&self, remote_id: &str) {
        self.state.lock().unwrap().folders.insert(remote_id.to_string());
    }

    pub fn file(&self, remote_id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(remote_id).cloned()
    }

    pub fn remove(&self, remote_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.files.remove(remote_id);
        state.folders.remove(remote_id);
    }

    /// Part numbers passed to `upload_part`, in call order
    pub fn uploaded_parts(&self) -> Vec<u32> {
        self.state.lock().unwrap().uploaded_parts.clone()
    }

    /// Part numbers passed to each `complete_multipart_upload`, in the order given
    pub fn completions(&self) -> Vec<Vec<u32>> {
        self.state.lock().unwrap().completed_with.clone()
    }

    /// Upload ids passed to `abort_multipart_upload`
    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    /// Open a multipart upload holding parts sent by an earlier process
    pub fn seed_multipart(&self, upload_id: &str, parts: &[(u32, &[u8])]) {
        let held = parts.iter().map(|(n, data)| (*n, data.to_vec())).collect();
        self.state.lock().unwrap().pending_parts.insert(upload_id.to_string(), held);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn cleanups(&self) -> u32 {
        self.state.lock().unwrap().cleanups
    }

    pub fn fail_next_uploads(&self, count: u32) {
        self.upload_failures.store(count, Ordering::SeqCst);
    }

    pub fn on_upload(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.upload_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    fn run_upload_hook(&self) {
        let hook = self.upload_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn fail_next_deletes(&self, count: u32) {
        self.delete_failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32, operation: &str) -> ProviderResult<()> {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::new(PROVIDER_TYPE, format!("Injected {} failure", operation)));
        }
        Ok(())
    }

    fn missing(remote_id: &str) -> ProviderError {
        ProviderError::new(PROVIDER_TYPE, format!("{} not found", remote_id))
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_chunked_upload: self.multipart,
        }
    }

    fn multipart(&self) -> Option<&dyn MultipartUpload> {
        Some(self)
    }

    async fn test_connection(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn get_quota(&self) -> ProviderResult<ProviderQuota> {
        let used = self.state.lock().unwrap().files.values().map(|f| f.len() as u64).sum();
        Ok(ProviderQuota {
            total: Some(1 << 30),
            used,
            available: Some((1 << 30) - used),
        })
    }

    async fn request_upload(&self, options: &UploadOptions) -> ProviderResult<UploadResponse> {
        Ok(UploadResponse::proxied(child_remote_id(
            options.parent_id.as_deref(),
            &options.name,
        )))
    }

    async fn upload_file(&self, remote_id: &str, data: ByteStream) -> ProviderResult<Option<String>> {
        self.run_upload_hook();
        Self::take_failure(&self.upload_failures, "upload")?;
        let bytes = collect_bytes(data)
            .await
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Failed to read upload", e))?;
        self.put(remote_id, &bytes);
        Ok(None)
    }

    async fn request_download(&self, remote_id: &str) -> ProviderResult<DownloadResponse> {
        Ok(DownloadResponse::proxied(remote_id))
    }

    async fn download_file(&self, remote_id: &str) -> ProviderResult<ByteStream> {
        let data = self.file(remote_id).ok_or_else(|| Self::missing(remote_id))?;
        // Small chunks so offset and checkpoint logic sees several of them
        let chunks: Vec<std::io::Result<Bytes>> = data.chunks(4).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn create_folder(&self, options: &CreateFolderOptions) -> ProviderResult<String> {
        let remote_id = child_remote_id(options.parent_id.as_deref(), &options.name);
        self.put_folder(&remote_id);
        Ok(remote_id)
    }

    async fn delete(&self, options: &DeleteOptions) -> ProviderResult<()> {
        Self::take_failure(&self.delete_failures, "delete")?;
        let mut state = self.state.lock().unwrap();
        state.files.remove(&options.remote_id);
        state.folders.remove(&options.remote_id);
        state.deleted.push(options.remote_id.clone());
        Ok(())
    }

    async fn move_item(&self, options: &MoveOptions) -> ProviderResult<String> {
        let parent = options.new_parent_id.clone().or_else(|| remote_parent_id(&options.remote_id));
        let name = options
            .new_name
            .clone()
            .unwrap_or_else(|| remote_basename(&options.remote_id).to_string());
        let new_id = child_remote_id(parent.as_deref(), &name);
        let mut state = self.state.lock().unwrap();
        let data = state.files.remove(&options.remote_id).ok_or_else(|| Self::missing(&options.remote_id))?;
        state.files.insert(new_id.clone(), data);
        Ok(new_id)
    }

    async fn copy(&self, options: &CopyOptions) -> ProviderResult<String> {
        let parent = options
            .target_parent_id
            .clone()
            .or_else(|| remote_parent_id(&options.remote_id));
        let name = options
            .new_name
            .clone()
            .unwrap_or_else(|| remote_basename(&options.remote_id).to_string());
        let new_id = child_remote_id(parent.as_deref(), &name);
        let data = self.file(&options.remote_id).ok_or_else(|| Self::missing(&options.remote_id))?;
        self.put(&new_id, &data);
        Ok(new_id)
    }

    /// Direct children only, unpaginated unless `limit` is set
    async fn list(&self, options: &ListOptions) -> ProviderResult<ListResult> {
        let folder = options.folder_id.as_deref().unwrap_or("").trim_matches('/').to_string();
        let is_child = |id: &str| remote_parent_id(id).unwrap_or_default() == folder && id != folder;

        let state = self.state.lock().unwrap();
        let mut result = ListResult::default();
        for (id, data) in state.files.iter().filter(|(id, _)| is_child(id)) {
            result.files.push(FileMetadata {
                remote_id: id.clone(),
                name: remote_basename(id).to_string(),
                mime_type: crate::utils::mime::guess_from_name(id).to_string(),
                size: data.len() as u64,
                modified_at: 0,
                hash: None,
            });
        }
        for id in state.folders.iter().filter(|id| is_child(id)) {
            result.folders.push(FolderMetadata {
                remote_id: id.clone(),
                name: remote_basename(id).to_string(),
                modified_at: 0,
            });
        }

        if let Some(limit) = options.limit {
            let offset: usize = options.page_token.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0);
            let total = result.files.len() + result.folders.len();
            let mut entries: Vec<Result<FileMetadata, FolderMetadata>> = result
                .folders
                .drain(..)
                .map(Err)
                .chain(result.files.drain(..).map(Ok))
                .collect();
            for entry in entries.drain(..).skip(offset).take(limit) {
                match entry {
                    Ok(file) => result.files.push(file),
                    Err(folder) => result.folders.push(folder),
                }
            }
            if offset + limit < total {
                result.next_page_token = Some((offset + limit).to_string());
            }
        }
        Ok(result)
    }

    async fn get_file_metadata(&self, remote_id: &str) -> ProviderResult<FileMetadata> {
        let data = self.file(remote_id).ok_or_else(|| Self::missing(remote_id))?;
        Ok(FileMetadata {
            remote_id: remote_id.to_string(),
            name: remote_basename(remote_id).to_string(),
            mime_type: crate::utils::mime::guess_from_name(remote_id).to_string(),
            size: data.len() as u64,
            modified_at: 0,
            hash: None,
        })
    }

    async fn get_folder_metadata(&self, remote_id: &str) -> ProviderResult<FolderMetadata> {
        if !self.state.lock().unwrap().folders.contains(remote_id) {
            return Err(Self::missing(remote_id));
        }
        Ok(FolderMetadata {
            remote_id: remote_id.to_string(),
            name: remote_basename(remote_id).to_string(),
            modified_at: 0,
        })
    }

    async fn cleanup(&self) {
        self.state.lock().unwrap().cleanups += 1;
    }
}

#[async_trait]
impl MultipartUpload for MemoryProvider {
    async fn initiate_multipart_upload(&self, options: &UploadOptions) -> ProviderResult<MultipartUploadInit> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.state
            .lock()
            .unwrap()
            .pending_parts
            .insert(upload_id.clone(), BTreeMap::new());
        Ok(MultipartUploadInit {
            upload_id,
            remote_id: child_remote_id(options.parent_id.as_deref(), &options.name),
        })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        _remote_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ProviderResult<UploadPartResult> {
        self.run_upload_hook();
        Self::take_failure(&self.upload_failures, "upload")?;
        let mut state = self.state.lock().unwrap();
        let held = state
            .pending_parts
            .get_mut(upload_id)
            .ok_or_else(|| ProviderError::new(PROVIDER_TYPE, format!("Unknown upload {}", upload_id)))?;
        held.insert(part_number, data.to_vec());
        state.uploaded_parts.push(part_number);
        Ok(UploadPartResult {
            part_number,
            etag: format!("etag-{}", part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        remote_id: &str,
        parts: &[UploadPartResult],
    ) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .completed_with
            .push(parts.iter().map(|p| p.part_number).collect());
        let stored = state
            .pending_parts
            .get(upload_id)
            .ok_or_else(|| ProviderError::new(PROVIDER_TYPE, format!("Unknown upload {}", upload_id)))?;
        let mut data = Vec::new();
        for part in parts {
            let bytes = stored.get(&part.part_number).ok_or_else(|| {
                ProviderError::new(PROVIDER_TYPE, format!("Part {} was never uploaded", part.part_number))
            })?;
            data.extend_from_slice(bytes);
        }
        state.pending_parts.remove(upload_id);
        state.files.insert(remote_id.to_string(), data);
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload_id: &str, _remote_id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state.pending_parts.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }
}
