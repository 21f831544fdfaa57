//! File records and the byte paths that go through the server.

use crate::error::{EngineError, EngineResult};
use crate::inventory::{FileNode, InventoryDb};
use crate::providers::{ByteStream, DownloadResponse, ProviderService, UploadOptions, UploadResponse};
use crate::utils::now_secs;
use crate::utils::path::{join_path, sanitize_filename};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub const UPLOAD_PROXY_PATH: &str = "/api/upload/proxy";
pub const DOWNLOAD_PROXY_PATH: &str = "/api/download/proxy";

#[derive(Debug, Clone)]
pub struct PrepareUpload {
    pub workspace_id: String,
    pub user_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub folder_id: Option<String>,
    pub provider_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedUpload {
    pub file: FileNode,
    pub upload: UploadResponse,
    /// Where the client sends the bytes: the provider URL or the proxy path
    pub upload_url: String,
    pub use_proxy: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDownload {
    pub file: FileNode,
    pub download_url: String,
    pub use_proxy: bool,
}

#[derive(Clone)]
pub struct FileCatalog {
    db: Arc<InventoryDb>,
    providers: ProviderService,
}

impl FileCatalog {
    pub fn new(db: Arc<InventoryDb>, providers: ProviderService) -> Self {
        Self { db, providers }
    }

    /// Reserve a virtual path for a new file and ask the provider where its
    /// bytes should go. A soft-deleted file at the same path is brought back
    /// under its old id.
    pub async fn prepare_upload(&self, params: PrepareUpload) -> EngineResult<PreparedUpload> {
        if params.name.trim().is_empty() {
            return Err(EngineError::validation("File name is required"));
        }
        if params.size == 0 {
            return Err(EngineError::validation("File size must be greater than 0"));
        }
        let name = sanitize_filename(&params.name);
        let record = self.providers.get_provider(&params.provider_id, &params.workspace_id)?;

        let (virtual_path, parent_id) = match params.folder_id.as_deref() {
            Some(folder_id) => {
                let folder = self
                    .db
                    .get_folder(folder_id)?
                    .filter(|f| !f.is_deleted && f.workspace_id == params.workspace_id)
                    .ok_or_else(|| EngineError::not_found("Folder"))?;
                let parent_id = match (&folder.remote_id, &folder.provider_id) {
                    (Some(remote_id), Some(owner)) if *owner == record.id => Some(remote_id.clone()),
                    _ => record.root_folder_id.clone(),
                };
                (join_path(&folder.virtual_path, &name), parent_id)
            }
            None => (join_path("/", &name), record.root_folder_id.clone()),
        };

        let existing = self.db.find_file_by_path(&params.workspace_id, &virtual_path)?;
        if existing.as_ref().is_some_and(|f| !f.is_deleted) {
            return Err(EngineError::conflict(format!("File already exists at path: {}", virtual_path)));
        }

        let provider = self.providers.instance(&record)?;
        let upload = provider
            .request_upload(&UploadOptions {
                name: name.clone(),
                mime_type: params.mime_type.clone(),
                size: params.size,
                parent_id,
            })
            .await;
        provider.cleanup().await;
        let upload = upload?;

        let now = now_secs();
        let file = match existing {
            Some(previous) => {
                let revived = FileNode {
                    name,
                    mime_type: params.mime_type,
                    size: params.size,
                    hash: None,
                    remote_id: upload.file_id.clone(),
                    provider_id: record.id.clone(),
                    folder_id: params.folder_id,
                    uploaded_by: params.user_id,
                    is_deleted: false,
                    starred: false,
                    updated_at: now,
                    ..previous
                };
                self.db.update_file(&revived)?;
                revived
            }
            None => {
                let file = FileNode {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: params.workspace_id,
                    virtual_path,
                    name,
                    mime_type: params.mime_type,
                    size: params.size,
                    hash: None,
                    remote_id: upload.file_id.clone(),
                    provider_id: record.id.clone(),
                    folder_id: params.folder_id,
                    uploaded_by: params.user_id,
                    is_deleted: false,
                    starred: false,
                    created_at: now,
                    updated_at: now,
                };
                self.db.insert_file(&file)?;
                file
            }
        };

        let proxy_url = format!("{}?fileId={}", UPLOAD_PROXY_PATH, file.id);
        let (upload_url, use_proxy) = match (&upload.upload_url, upload.use_direct_upload) {
            (Some(url), true) => (url.clone(), false),
            _ => (proxy_url, true),
        };
        tracing::info!(
            target: "files",
            file_id = %file.id,
            provider_id = %record.id,
            path = %file.virtual_path,
            use_proxy,
            "Upload prepared"
        );

        Ok(PreparedUpload {
            file,
            upload,
            upload_url,
            use_proxy,
        })
    }

    /// Resolve where a client can fetch a file from
    pub async fn prepare_download(&self, file_id: &str, workspace_id: Option<&str>) -> EngineResult<PreparedDownload> {
        let file = self.live_file(file_id, workspace_id)?;
        let record = self.providers.get_provider_unchecked(&file.provider_id)?;
        let provider = self.providers.instance(&record)?;
        let response = provider.request_download(&file.remote_id).await;
        provider.cleanup().await;

        let (download_url, use_proxy) = match response? {
            DownloadResponse {
                download_url: Some(url),
                use_direct_download: true,
                ..
            } => (url, false),
            _ => (format!("{}?fileId={}", DOWNLOAD_PROXY_PATH, file.id), true),
        };
        Ok(PreparedDownload {
            file,
            download_url,
            use_proxy,
        })
    }

    /// Stream a request body to the file's provider. A failed upload leaves
    /// the record soft-deleted so the path can be claimed again.
    pub async fn proxy_upload(&self, file_id: &str, workspace_id: Option<&str>, data: ByteStream) -> EngineResult<FileNode> {
        let file = self.live_file(file_id, workspace_id)?;
        let record = self.providers.get_provider_unchecked(&file.provider_id)?;
        let provider = self.providers.instance(&record)?;
        tracing::debug!(target: "files", file_id = %file.id, provider_id = %record.id, "Streaming upload to provider");

        let result = provider.upload_file(&file.remote_id, data).await;
        provider.cleanup().await;

        match result {
            Ok(Some(remote_id)) if remote_id != file.remote_id => {
                let updated_at = now_secs();
                self.db
                    .set_file_location(&file.id, &file.provider_id, &remote_id, updated_at)?;
                Ok(FileNode {
                    remote_id,
                    updated_at,
                    ..file
                })
            }
            Ok(_) => Ok(file),
            Err(e) => {
                tracing::error!(target: "files", file_id = %file.id, error = %e, "Proxy upload failed");
                let abandoned = FileNode {
                    is_deleted: true,
                    updated_at: now_secs(),
                    ..file
                };
                if let Err(cleanup) = self.db.update_file(&abandoned) {
                    tracing::error!(target: "files", file_id = %abandoned.id, error = %cleanup, "Failed to release file after upload failure");
                }
                Err(e.into())
            }
        }
    }

    /// Open the file's bytes on its provider
    pub async fn proxy_download(&self, file_id: &str, workspace_id: Option<&str>) -> EngineResult<(FileNode, ByteStream)> {
        let file = self.live_file(file_id, workspace_id)?;
        let record = self.providers.get_provider_unchecked(&file.provider_id)?;
        let provider = self.providers.instance(&record)?;
        let stream = provider.download_file(&file.remote_id).await;
        provider.cleanup().await;
        tracing::debug!(target: "files", file_id = %file.id, provider_id = %record.id, "Streaming download from provider");
        Ok((file, stream?))
    }

    fn live_file(&self, file_id: &str, workspace_id: Option<&str>) -> EngineResult<FileNode> {
        self.db
            .get_file(file_id)?
            .filter(|f| !f.is_deleted && workspace_id.is_none_or(|ws| f.workspace_id == ws))
            .ok_or_else(|| EngineError::not_found("File"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::FolderNode;
    use crate::inventory::test_support::{provider_record, temp_db};
    use crate::providers::collect_bytes;
    use crate::providers::memory::{MemoryProvider, registry_with};
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        catalog: FileCatalog,
        db: Arc<InventoryDb>,
        provider: Arc<MemoryProvider>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let (db, dir) = temp_db();
        let provider = Arc::new(MemoryProvider::new(false));
        db.insert_provider(&provider_record("p1", "ws", "memory")).unwrap();
        let providers = ProviderService::new(db.clone(), Arc::new(registry_with(&[("memory", provider.clone())])));
        Fixture {
            catalog: FileCatalog::new(db.clone(), providers),
            db,
            provider,
            _dir: dir,
        }
    }

    fn params(name: &str, folder_id: Option<&str>) -> PrepareUpload {
        PrepareUpload {
            workspace_id: "ws".into(),
            user_id: "alice".into(),
            name: name.into(),
            mime_type: "text/plain".into(),
            size: 5,
            folder_id: folder_id.map(str::to_string),
            provider_id: "p1".into(),
        }
    }

    fn body(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn test_prepare_upload_inserts_and_conflicts() {
        let fx = fixture();
        let prepared = fx.catalog.prepare_upload(params("re:port.txt", None)).await.unwrap();
        assert_eq!(prepared.file.virtual_path, "/re_port.txt");
        assert_eq!(prepared.file.remote_id, "re_port.txt");
        assert!(prepared.use_proxy);
        assert_eq!(prepared.upload_url, format!("/api/upload/proxy?fileId={}", prepared.file.id));
        assert_eq!(fx.provider.cleanups(), 1);

        let err = fx.catalog.prepare_upload(params("re:port.txt", None)).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let empty = fx.catalog.prepare_upload(params("  ", None)).await.unwrap_err();
        assert!(matches!(empty, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_prepare_upload_revives_deleted_path() {
        let fx = fixture();
        let first = fx.catalog.prepare_upload(params("a.txt", None)).await.unwrap();
        fx.db
            .update_file(&FileNode {
                is_deleted: true,
                starred: true,
                ..first.file.clone()
            })
            .unwrap();

        let second = fx.catalog.prepare_upload(params("a.txt", None)).await.unwrap();
        assert_eq!(second.file.id, first.file.id);
        let stored = fx.db.get_file(&first.file.id).unwrap().unwrap();
        assert!(!stored.is_deleted);
        assert!(!stored.starred);
    }

    #[tokio::test]
    async fn test_prepare_upload_into_folder_uses_its_remote_id() {
        let fx = fixture();
        fx.db
            .insert_folder(&FolderNode {
                id: "d1".into(),
                workspace_id: "ws".into(),
                virtual_path: "/docs".into(),
                name: "docs".into(),
                remote_id: Some("docs".into()),
                provider_id: Some("p1".into()),
                parent_id: None,
                created_by: "alice".into(),
                is_deleted: false,
                starred: false,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();

        let prepared = fx.catalog.prepare_upload(params("a.txt", Some("d1"))).await.unwrap();
        assert_eq!(prepared.file.virtual_path, "/docs/a.txt");
        assert_eq!(prepared.file.remote_id, "docs/a.txt");
        assert_eq!(prepared.file.folder_id.as_deref(), Some("d1"));

        let missing = fx.catalog.prepare_upload(params("a.txt", Some("nope"))).await.unwrap_err();
        assert!(matches!(missing, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_proxy_round_trip_through_provider() {
        let fx = fixture();
        let prepared = fx.catalog.prepare_upload(params("a.txt", None)).await.unwrap();

        fx.catalog
            .proxy_upload(&prepared.file.id, Some("ws"), body(b"hello"))
            .await
            .unwrap();
        assert_eq!(fx.provider.file("a.txt").unwrap(), b"hello");

        let (file, stream) = fx.catalog.proxy_download(&prepared.file.id, Some("ws")).await.unwrap();
        assert_eq!(file.name, "a.txt");
        assert_eq!(collect_bytes(stream).await.unwrap(), b"hello");

        let download = fx.catalog.prepare_download(&prepared.file.id, None).await.unwrap();
        assert!(download.use_proxy);
        assert_eq!(download.download_url, format!("/api/download/proxy?fileId={}", file.id));

        let other = fx.catalog.proxy_download(&prepared.file.id, Some("other")).await;
        assert!(matches!(other, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_proxy_upload_releases_path() {
        let fx = fixture();
        let prepared = fx.catalog.prepare_upload(params("a.txt", None)).await.unwrap();
        fx.provider.fail_next_uploads(1);

        let err = fx.catalog.proxy_upload(&prepared.file.id, None, body(b"hello")).await.unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
        assert!(fx.db.get_file(&prepared.file.id).unwrap().unwrap().is_deleted);
        assert_eq!(fx.provider.cleanups(), 2);

        let again = fx.catalog.prepare_upload(params("a.txt", None)).await.unwrap();
        assert_eq!(again.file.id, prepared.file.id);
    }
}
