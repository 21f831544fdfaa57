//! Provider backed by a directory on the server's filesystem.
//!
//! Remote ids are root-relative paths. Native multipart is emulated with a
//! staging directory under the root: each part is a file named by its part
//! number, and completion concatenates them in order.

use super::{
    ByteStream, CopyOptions, CreateFolderOptions, DEFAULT_LIST_LIMIT, DeleteOptions, DownloadResponse,
    FileMetadata, FolderMetadata, ListOptions, ListResult, MoveOptions, MultipartUpload, MultipartUploadInit,
    ProviderCapabilities, ProviderQuota, StorageProvider, UploadOptions, UploadPartResult, UploadResponse,
    child_remote_id, remote_basename, remote_parent_id,
};
use crate::error::{ProviderError, ProviderResult};
use crate::utils::{mime, path::sanitize_filename};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

pub const PROVIDER_TYPE: &str = "local";

/// Hidden from listings and quota
const STAGING_DIR: &str = ".drivebase-parts";
const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalConfig {
    root_path: PathBuf,
}

pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build from a decrypted config of the form `{"rootPath": "..."}`
    pub fn from_config(config: &serde_json::Value) -> ProviderResult<Self> {
        let config: LocalConfig = serde_json::from_value(config.clone())
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Invalid local provider config", e))?;
        Ok(Self::new(config.root_path))
    }

    /// Map a remote id to a path under the root. Anything that would climb
    /// out of the root is rejected.
    fn resolve(&self, remote_id: &str) -> ProviderResult<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(remote_id.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(ProviderError::new(
                        PROVIDER_TYPE,
                        format!("Remote id escapes the provider root: {}", remote_id),
                    ));
                }
            }
        }
        Ok(path)
    }

    fn staging_dir(&self, upload_id: &str) -> ProviderResult<PathBuf> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ProviderError::new(
                PROVIDER_TYPE,
                format!("Invalid multipart upload id: {}", upload_id),
            ));
        }
        Ok(self.root.join(STAGING_DIR).join(upload_id))
    }

    fn io_error(what: impl Into<String>, e: io::Error) -> ProviderError {
        let what = what.into();
        ProviderError::with_source(PROVIDER_TYPE, format!("{}: {}", what, e), e)
    }

    /// Write a stream next to `target` and rename it into place
    async fn write_atomically(&self, target: &Path, mut data: ByteStream) -> ProviderResult<u64> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error("Failed to create parent directory", e))?;
        }

        let tmp = target.with_file_name(format!(".{}.partial", Uuid::new_v4()));
        let result: io::Result<u64> = async {
            let mut file = fs::File::create(&tmp).await?;
            let mut written = 0u64;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok(written)
        }
        .await;

        match result {
            Ok(written) => {
                fs::rename(&tmp, target)
                    .await
                    .map_err(|e| Self::io_error("Failed to move upload into place", e))?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(Self::io_error("Failed to write file", e))
            }
        }
    }

    async fn hash_file(path: &Path) -> io::Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
        let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
        while let Some((src, dst)) = stack.pop() {
            fs::create_dir_all(&dst).await?;
            let mut entries = fs::read_dir(&src).await?;
            while let Some(entry) = entries.next_entry().await? {
                let target = dst.join(entry.file_name());
                if entry.file_type().await?.is_dir() {
                    stack.push((entry.path(), target));
                } else {
                    fs::copy(entry.path(), target).await?;
                }
            }
        }
        Ok(())
    }
}

fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp())
        .unwrap_or(0)
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_chunked_upload: true,
        }
    }

    fn multipart(&self) -> Option<&dyn MultipartUpload> {
        Some(self)
    }

    async fn test_connection(&self) -> ProviderResult<()> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| Self::io_error(format!("Root {} is not accessible", self.root.display()), e))?;
        if !meta.is_dir() {
            return Err(ProviderError::new(
                PROVIDER_TYPE,
                format!("Root {} is not a directory", self.root.display()),
            ));
        }
        Ok(())
    }

    async fn get_quota(&self) -> ProviderResult<ProviderQuota> {
        let mut used = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| Self::io_error("Failed to read directory", e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_error("Failed to read directory entry", e))?
            {
                if dir == self.root && entry.file_name() == STAGING_DIR {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Self::io_error("Failed to stat entry", e))?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    used += meta.len();
                }
            }
        }

        Ok(ProviderQuota {
            total: None,
            used,
            available: None,
        })
    }

    async fn request_upload(&self, options: &UploadOptions) -> ProviderResult<UploadResponse> {
        let remote_id = child_remote_id(options.parent_id.as_deref(), &sanitize_filename(&options.name));
        self.resolve(&remote_id)?;
        Ok(UploadResponse::proxied(remote_id))
    }

    async fn upload_file(&self, remote_id: &str, data: ByteStream) -> ProviderResult<Option<String>> {
        let target = self.resolve(remote_id)?;
        let written = self.write_atomically(&target, data).await?;
        tracing::debug!(target: "providers::local", remote_id = %remote_id, bytes = written, "File written");
        Ok(None)
    }

    async fn request_download(&self, remote_id: &str) -> ProviderResult<DownloadResponse> {
        self.resolve(remote_id)?;
        Ok(DownloadResponse::proxied(remote_id))
    }

    async fn download_file(&self, remote_id: &str) -> ProviderResult<ByteStream> {
        self.download_file_from(remote_id, 0).await
    }

    async fn download_file_from(&self, remote_id: &str, offset: u64) -> ProviderResult<ByteStream> {
        let path = self.resolve(remote_id)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Self::io_error(format!("Failed to open {}", remote_id), e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| Self::io_error("Failed to seek", e))?;
        }
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn create_folder(&self, options: &CreateFolderOptions) -> ProviderResult<String> {
        let remote_id = child_remote_id(options.parent_id.as_deref(), &sanitize_filename(&options.name));
        let path = self.resolve(&remote_id)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| Self::io_error("Failed to create folder", e))?;
        Ok(remote_id)
    }

    async fn delete(&self, options: &DeleteOptions) -> ProviderResult<()> {
        let path = self.resolve(&options.remote_id)?;
        if path == self.root {
            return Err(ProviderError::new(PROVIDER_TYPE, "Refusing to delete the provider root"));
        }

        let result = if options.is_folder {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(format!("Failed to delete {}", options.remote_id), e)),
        }
    }

    async fn move_item(&self, options: &MoveOptions) -> ProviderResult<String> {
        let from = self.resolve(&options.remote_id)?;
        let parent = options
            .new_parent_id
            .clone()
            .or_else(|| remote_parent_id(&options.remote_id));
        let name = options
            .new_name
            .as_deref()
            .map(sanitize_filename)
            .unwrap_or_else(|| remote_basename(&options.remote_id).to_string());
        let new_id = child_remote_id(parent.as_deref(), &name);
        let to = self.resolve(&new_id)?;

        if let Some(dir) = to.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Self::io_error("Failed to create parent directory", e))?;
        }
        fs::rename(&from, &to)
            .await
            .map_err(|e| Self::io_error(format!("Failed to move {}", options.remote_id), e))?;
        Ok(new_id)
    }

    async fn copy(&self, options: &CopyOptions) -> ProviderResult<String> {
        let from = self.resolve(&options.remote_id)?;
        let parent = options
            .target_parent_id
            .clone()
            .or_else(|| remote_parent_id(&options.remote_id));
        let name = options
            .new_name
            .as_deref()
            .map(sanitize_filename)
            .unwrap_or_else(|| remote_basename(&options.remote_id).to_string());
        let new_id = child_remote_id(parent.as_deref(), &name);
        let to = self.resolve(&new_id)?;

        let meta = fs::metadata(&from)
            .await
            .map_err(|e| Self::io_error(format!("Failed to stat {}", options.remote_id), e))?;
        if meta.is_dir() {
            Self::copy_dir(&from, &to)
                .await
                .map_err(|e| Self::io_error("Failed to copy folder", e))?;
        } else {
            if let Some(dir) = to.parent() {
                fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Self::io_error("Failed to create parent directory", e))?;
            }
            fs::copy(&from, &to)
                .await
                .map_err(|e| Self::io_error("Failed to copy file", e))?;
        }
        Ok(new_id)
    }

    async fn list(&self, options: &ListOptions) -> ProviderResult<ListResult> {
        let folder_id = options.folder_id.as_deref().unwrap_or("");
        let dir = self.resolve(folder_id)?;
        let offset = match options.page_token.as_deref() {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::new(PROVIDER_TYPE, format!("Invalid page token: {}", token)))?,
        };
        let limit = options.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| Self::io_error(format!("Failed to list {}", folder_id), e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error("Failed to read directory entry", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == STAGING_DIR || name.ends_with(".partial") {
                continue;
            }
            names.push((name, entry.path()));
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let total = names.len();
        let mut result = ListResult::default();
        for (name, path) in names.into_iter().skip(offset).take(limit) {
            let meta = fs::metadata(&path)
                .await
                .map_err(|e| Self::io_error("Failed to stat entry", e))?;
            let remote_id = child_remote_id(Some(folder_id), &name);
            if meta.is_dir() {
                result.folders.push(FolderMetadata {
                    remote_id,
                    name,
                    modified_at: modified_secs(&meta),
                });
            } else {
                result.files.push(FileMetadata {
                    remote_id,
                    mime_type: mime::guess_from_name(&name).to_string(),
                    name,
                    size: meta.len(),
                    modified_at: modified_secs(&meta),
                    hash: None,
                });
            }
        }
        if offset + limit < total {
            result.next_page_token = Some((offset + limit).to_string());
        }
        Ok(result)
    }

    async fn get_file_metadata(&self, remote_id: &str) -> ProviderResult<FileMetadata> {
        let path = self.resolve(remote_id)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::io_error(format!("Failed to stat {}", remote_id), e))?;
        if meta.is_dir() {
            return Err(ProviderError::new(PROVIDER_TYPE, format!("{} is a folder", remote_id)));
        }
        let hash = Self::hash_file(&path)
            .await
            .map_err(|e| Self::io_error("Failed to hash file", e))?;
        let name = remote_basename(remote_id).to_string();

        Ok(FileMetadata {
            remote_id: remote_id.to_string(),
            mime_type: mime::guess_from_name(&name).to_string(),
            name,
            size: meta.len(),
            modified_at: modified_secs(&meta),
            hash: Some(hash),
        })
    }

    async fn get_folder_metadata(&self, remote_id: &str) -> ProviderResult<FolderMetadata> {
        let path = self.resolve(remote_id)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::io_error(format!("Failed to stat {}", remote_id), e))?;
        if !meta.is_dir() {
            return Err(ProviderError::new(PROVIDER_TYPE, format!("{} is not a folder", remote_id)));
        }
        Ok(FolderMetadata {
            remote_id: remote_id.to_string(),
            name: remote_basename(remote_id).to_string(),
            modified_at: modified_secs(&meta),
        })
    }
}

#[async_trait]
impl MultipartUpload for LocalProvider {
    async fn initiate_multipart_upload(&self, options: &UploadOptions) -> ProviderResult<MultipartUploadInit> {
        let remote_id = child_remote_id(options.parent_id.as_deref(), &sanitize_filename(&options.name));
        self.resolve(&remote_id)?;

        let upload_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.staging_dir(&upload_id)?)
            .await
            .map_err(|e| Self::io_error("Failed to create multipart staging directory", e))?;

        tracing::debug!(target: "providers::local", upload_id = %upload_id, remote_id = %remote_id, "Multipart upload initiated");
        Ok(MultipartUploadInit { upload_id, remote_id })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        _remote_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ProviderResult<UploadPartResult> {
        let staging = self.staging_dir(upload_id)?;
        if !fs::try_exists(&staging).await.unwrap_or(false) {
            return Err(ProviderError::new(
                PROVIDER_TYPE,
                format!("Unknown multipart upload: {}", upload_id),
            ));
        }

        let etag = format!("{:x}", Sha256::digest(&data));
        fs::write(staging.join(format!("{:08}.part", part_number)), &data)
            .await
            .map_err(|e| Self::io_error(format!("Failed to write part {}", part_number), e))?;
        Ok(UploadPartResult { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        remote_id: &str,
        parts: &[UploadPartResult],
    ) -> ProviderResult<()> {
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(ProviderError::new(PROVIDER_TYPE, "Parts must be sorted by part number"));
        }

        let staging = self.staging_dir(upload_id)?;
        let target = self.resolve(remote_id)?;
        let mut files = Vec::with_capacity(parts.len());
        for part in parts {
            files.push(staging.join(format!("{:08}.part", part.part_number)));
        }

        let data: ByteStream = Box::pin(
            futures::stream::iter(files)
                .then(|path| async move { fs::read(path).await.map(Bytes::from) }),
        );
        self.write_atomically(&target, data).await?;

        if let Err(e) = fs::remove_dir_all(&staging).await {
            tracing::warn!(target: "providers::local", upload_id = %upload_id, error = %e, "Failed to remove multipart staging directory");
        }
        tracing::debug!(target: "providers::local", upload_id = %upload_id, parts = parts.len(), "Multipart upload completed");
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload_id: &str, _remote_id: &str) -> ProviderResult<()> {
        match fs::remove_dir_all(self.staging_dir(upload_id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error("Failed to abort multipart upload", e)),
        }
    }
}
