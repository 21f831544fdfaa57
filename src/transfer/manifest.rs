//! On-disk checkpoint of one provider-to-provider transfer.
//!
//! Each transfer owns `<cache_root>/<workspace>/<file>/` holding
//! `manifest.json` and the cached source bytes in `payload.bin`. The
//! manifest is the only resume state for file bytes across restarts, so a
//! newer build must be able to read what an older one wrote: unknown fields
//! are ignored and missing ones default.

use crate::error::EngineResult;
use crate::inventory::FileNode;
use crate::providers::UploadPartResult;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "manifest.json";
const PAYLOAD_FILE: &str = "payload.bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManifest {
    pub file_id: String,
    pub source_provider_id: String,
    pub target_provider_id: String,
    pub total_size: u64,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub uploaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart: Option<MultipartState>,
    /// Where the target holds the finished copy; set once the upload is done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_remote_id: Option<String>,
    /// The source copy was removed; only the catalog update is left
    #[serde(default)]
    pub source_deleted: bool,
}

/// Remote multipart upload in progress on the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartState {
    pub upload_id: String,
    pub remote_id: String,
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
    /// Set once the target assembled the parts; the upload id is gone after that
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

impl TransferManifest {
    pub fn new(file: &FileNode, target_provider_id: &str) -> Self {
        Self {
            file_id: file.id.clone(),
            source_provider_id: file.provider_id.clone(),
            target_provider_id: target_provider_id.to_string(),
            total_size: file.size,
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            multipart: None,
            target_remote_id: None,
            source_deleted: false,
        }
    }

    /// A manifest left behind for a different file state must not be resumed
    pub fn matches(&self, file: &FileNode, target_provider_id: &str) -> bool {
        self.file_id == file.id
            && self.source_provider_id == file.provider_id
            && self.target_provider_id == target_provider_id
            && self.total_size == file.size
    }

    pub fn download_complete(&self) -> bool {
        self.downloaded_bytes >= self.total_size
    }

    pub fn multipart_completed(&self) -> bool {
        self.multipart.as_ref().is_some_and(|m| m.completed)
    }

    pub fn has_part(&self, part_number: u32) -> bool {
        self.multipart
            .as_ref()
            .is_some_and(|m| m.parts.iter().any(|p| p.part_number == part_number))
    }

    /// Append a finished part. Parts already recorded are kept as they are.
    pub fn record_part(&mut self, part: CompletedPart) {
        let Some(multipart) = self.multipart.as_mut() else {
            return;
        };
        if multipart.parts.iter().any(|p| p.part_number == part.part_number) {
            return;
        }
        multipart.parts.push(part);
        self.uploaded_bytes = self.uploaded_bytes.max(multipart.parts.iter().map(|p| p.size).sum());
    }

    /// Parts in part-number order, as multipart completion expects them
    pub fn sorted_parts(&self) -> Vec<UploadPartResult> {
        let mut parts: Vec<UploadPartResult> = self
            .multipart
            .iter()
            .flat_map(|m| m.parts.iter())
            .map(|p| UploadPartResult {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }
}

/// Scratch directory of one transfer
#[derive(Debug, Clone)]
pub struct TransferDir {
    dir: PathBuf,
}

impl TransferDir {
    pub fn new(cache_root: &Path, workspace_id: &str, file_id: &str) -> Self {
        Self {
            dir: cache_root.join(workspace_id).join(file_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn payload_path(&self) -> PathBuf {
        self.dir.join(PAYLOAD_FILE)
    }

    pub async fn create(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Read the manifest; a missing or unreadable one reads as `None`
    pub async fn load(&self) -> Option<TransferManifest> {
        let path = self.manifest_path();
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(target: "transfer", path = %path.display(), error = %e, "Failed to read transfer manifest");
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(target: "transfer", path = %path.display(), error = %e, "Discarding corrupt transfer manifest");
                None
            }
        }
    }

    /// Write through a temp file so a crash never leaves a torn manifest
    pub async fn save(&self, manifest: &TransferManifest) -> EngineResult<()> {
        let path = self.manifest_path();
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
        let content = serde_json::to_vec_pretty(manifest).context("Failed to serialize transfer manifest")?;
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Size of the cached payload, 0 when absent
    pub async fn payload_len(&self) -> u64 {
        tokio::fs::metadata(self.payload_path())
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
