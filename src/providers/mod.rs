//! Storage provider contract and the backends that implement it.
//!
//! Every backend implements [`StorageProvider`]. Backends that can accept a
//! file in independently uploaded parts also implement [`MultipartUpload`]
//! and advertise it through [`ProviderCapabilities::supports_chunked_upload`];
//! callers go through [`multipart_capable`] and never inspect concrete types.

pub mod local;
pub mod registry;
pub mod service;
pub mod webdav;

#[cfg(test)]
pub mod memory;

pub use registry::{AuthType, ConfigField, ProviderFactory, ProviderInfo, ProviderRegistration, ProviderRegistry};
pub use service::{ConnectProvider, ProviderService};

use crate::error::ProviderResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;

/// Boxed stream of file bytes flowing in or out of a provider
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Default page size for `list`
pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    /// The provider implements [`MultipartUpload`]
    pub supports_chunked_upload: bool,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Remote id of the destination folder. `None` is the provider root.
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Remote id the bytes will land at
    pub file_id: String,
    pub upload_url: Option<String>,
    pub upload_fields: Option<HashMap<String, String>>,
    /// When false the bytes must be proxied through the server
    pub use_direct_upload: bool,
}

impl UploadResponse {
    pub fn proxied(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            upload_url: None,
            upload_fields: None,
            use_direct_upload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub file_id: String,
    pub download_url: Option<String>,
    pub use_direct_download: bool,
}

impl DownloadResponse {
    pub fn proxied(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            download_url: None,
            use_direct_download: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateFolderOptions {
    pub name: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub remote_id: String,
    pub is_folder: bool,
}

#[derive(Debug, Clone)]
pub struct MoveOptions {
    pub remote_id: String,
    pub new_parent_id: Option<String>,
    pub new_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub remote_id: String,
    pub target_parent_id: Option<String>,
    pub new_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// `None` lists the provider root
    pub folder_id: Option<String>,
    pub limit: Option<usize>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQuota {
    pub total: Option<u64>,
    pub used: u64,
    pub available: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub remote_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Unix seconds
    pub modified_at: i64,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMetadata {
    pub remote_id: String,
    pub name: String,
    pub modified_at: i64,
}

/// One page of a folder listing
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub files: Vec<FileMetadata>,
    pub folders: Vec<FolderMetadata>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartUploadInit {
    pub upload_id: String,
    pub remote_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartResult {
    /// 1-based
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn provider_type(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    /// The multipart sub-interface, if implemented. Callers should use
    /// [`multipart_capable`], which also honors the capability flag.
    fn multipart(&self) -> Option<&dyn MultipartUpload> {
        None
    }

    async fn test_connection(&self) -> ProviderResult<()>;

    async fn get_quota(&self) -> ProviderResult<ProviderQuota>;

    /// Reserve a destination and say how the bytes should get there
    async fn request_upload(&self, options: &UploadOptions) -> ProviderResult<UploadResponse>;

    /// Stream bytes to `remote_id`. Returns a new remote id when the backend
    /// assigns its own.
    async fn upload_file(&self, remote_id: &str, data: ByteStream) -> ProviderResult<Option<String>>;

    async fn request_download(&self, remote_id: &str) -> ProviderResult<DownloadResponse>;

    async fn download_file(&self, remote_id: &str) -> ProviderResult<ByteStream>;

    /// Download starting at a byte offset
    async fn download_file_from(&self, remote_id: &str, offset: u64) -> ProviderResult<ByteStream> {
        let stream = self.download_file(remote_id).await?;
        Ok(skip_bytes(stream, offset))
    }

    /// Returns the remote id of the new folder
    async fn create_folder(&self, options: &CreateFolderOptions) -> ProviderResult<String>;

    /// Deleting an item that is already gone succeeds
    async fn delete(&self, options: &DeleteOptions) -> ProviderResult<()>;

    /// Returns the remote id after the move
    async fn move_item(&self, options: &MoveOptions) -> ProviderResult<String>;

    /// Returns the remote id of the copy
    async fn copy(&self, options: &CopyOptions) -> ProviderResult<String>;

    async fn list(&self, options: &ListOptions) -> ProviderResult<ListResult>;

    async fn get_file_metadata(&self, remote_id: &str) -> ProviderResult<FileMetadata>;

    async fn get_folder_metadata(&self, remote_id: &str) -> ProviderResult<FolderMetadata>;

    /// Release connections or temp state. Must be called when the caller is
    /// done with the instance, whatever the outcome.
    async fn cleanup(&self) {}
}

/// Native part-by-part upload
#[async_trait]
pub trait MultipartUpload: Send + Sync {
    async fn initiate_multipart_upload(&self, options: &UploadOptions) -> ProviderResult<MultipartUploadInit>;

    /// Uploading the same part number again replaces it
    async fn upload_part(
        &self,
        upload_id: &str,
        remote_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ProviderResult<UploadPartResult>;

    /// `parts` must be sorted by part number
    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        remote_id: &str,
        parts: &[UploadPartResult],
    ) -> ProviderResult<()>;

    async fn abort_multipart_upload(&self, upload_id: &str, remote_id: &str) -> ProviderResult<()>;
}

/// The multipart interface when the provider both advertises and implements it
pub fn multipart_capable(provider: &dyn StorageProvider) -> Option<&dyn MultipartUpload> {
    if provider.capabilities().supports_chunked_upload {
        provider.multipart()
    } else {
        None
    }
}

/// Drop the first `offset` bytes of a stream
pub fn skip_bytes(stream: ByteStream, offset: u64) -> ByteStream {
    if offset == 0 {
        return stream;
    }

    let mut remaining = offset;
    Box::pin(stream.filter_map(move |chunk| {
        let item = match chunk {
            Err(e) => Some(Err(e)),
            Ok(bytes) if remaining >= bytes.len() as u64 => {
                remaining -= bytes.len() as u64;
                None
            }
            Ok(mut bytes) => {
                let tail = bytes.split_off(remaining as usize);
                remaining = 0;
                Some(Ok(tail))
            }
        };
        futures::future::ready(item)
    }))
}

// Path-addressed backends (local, webdav) use root-relative paths such as
// `docs/a.txt` as remote ids. The root itself is the empty string.

pub(crate) fn child_remote_id(parent_id: Option<&str>, name: &str) -> String {
    match parent_id.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(parent) => format!("{}/{}", parent, name),
        None => name.to_string(),
    }
}

pub(crate) fn remote_parent_id(remote_id: &str) -> Option<String> {
    remote_id
        .trim_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
}

pub(crate) fn remote_basename(remote_id: &str) -> &str {
    let trimmed = remote_id.trim_matches('/');
    trimmed.rsplit_once('/').map_or(trimmed, |(_, name)| name)
}

/// Collect a stream into memory
pub async fn collect_bytes(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
