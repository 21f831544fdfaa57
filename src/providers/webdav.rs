//! WebDAV backend. Proxy-only: no direct URLs and no native multipart, so
//! every byte flows through the server.

use super::{
    ByteStream, CopyOptions, CreateFolderOptions, DEFAULT_LIST_LIMIT, DeleteOptions, DownloadResponse,
    FileMetadata, FolderMetadata, ListOptions, ListResult, MoveOptions, ProviderQuota, StorageProvider,
    UploadOptions, UploadResponse, child_remote_id, remote_basename, remote_parent_id, skip_bytes,
};
use crate::error::{ProviderError, ProviderResult};
use crate::utils::{mime, path::sanitize_filename};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

pub const PROVIDER_TYPE: &str = "webdav";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getcontenttype/>
    <d:getlastmodified/>
    <d:getetag/>
  </d:prop>
</d:propfind>"#;

const QUOTA_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:quota-used-bytes/>
    <d:quota-available-bytes/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebDavConfig {
    url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// One `<response>` of a multistatus body
#[derive(Debug, Clone, Default, PartialEq)]
struct DavEntry {
    href: String,
    is_collection: bool,
    content_length: Option<u64>,
    content_type: Option<String>,
    last_modified: Option<i64>,
    quota_used: Option<u64>,
    quota_available: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum DavField {
    Href,
    ContentLength,
    ContentType,
    LastModified,
    QuotaUsed,
    QuotaAvailable,
}

pub struct WebDavProvider {
    client: Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl WebDavProvider {
    pub fn new(base_url: &str, username: Option<String>, password: Option<String>) -> ProviderResult<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, format!("Invalid server URL {}", base_url), e))?;
        if base.cannot_be_a_base() {
            return Err(ProviderError::new(PROVIDER_TYPE, format!("Invalid server URL {}", base_url)));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            base,
            username,
            password,
        })
    }

    /// Build from a decrypted config of the form `{"url", "username", "password"}`
    pub fn from_config(config: &serde_json::Value) -> ProviderResult<Self> {
        let config: WebDavConfig = serde_json::from_value(config.clone())
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Invalid WebDAV provider config", e))?;
        Self::new(&config.url, config.username, config.password)
    }

    fn url_for(&self, remote_id: &str, collection: bool) -> ProviderResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ProviderError::new(PROVIDER_TYPE, "Server URL cannot carry a path"))?;
            segments.pop_if_empty();
            for segment in remote_id.split('/').filter(|s| !s.is_empty()) {
                if segment == "." || segment == ".." {
                    return Err(ProviderError::new(
                        PROVIDER_TYPE,
                        format!("Remote id escapes the provider root: {}", remote_id),
                    ));
                }
                segments.push(segment);
            }
            if collection {
                segments.push("");
            }
        }
        Ok(url)
    }

    /// Map an `href` from a multistatus body back to a remote id
    fn remote_id_for_href(&self, href: &str) -> Option<String> {
        let url = self.base.join(href).ok()?;
        let base_path = self.base.path().trim_end_matches('/');
        let relative = url.path().strip_prefix(base_path)?;
        let decoded = urlencoding::decode(relative).ok()?;
        Some(decoded.trim_matches('/').to_string())
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, what: &str, builder: RequestBuilder) -> ProviderResult<Response> {
        builder
            .send()
            .await
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, format!("{} failed: {}", what, e), e))
    }

    fn status_error(what: &str, status: StatusCode) -> ProviderError {
        ProviderError::new(PROVIDER_TYPE, format!("{} failed with HTTP {}", what, status))
    }

    async fn propfind(&self, remote_id: &str, depth: u8, body: &'static str) -> ProviderResult<Vec<DavEntry>> {
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Invalid method", e))?;
        let url = self.url_for(remote_id, depth > 0)?;
        let response = self
            .send(
                "PROPFIND",
                self.request(method, url)
                    .header("Depth", depth.to_string())
                    .header("Content-Type", "application/xml; charset=utf-8")
                    .body(body),
            )
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::new(PROVIDER_TYPE, format!("{} not found", remote_id)));
        }
        if !status.is_success() {
            return Err(Self::status_error("PROPFIND", status));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Failed to read PROPFIND response", e))?;
        parse_multistatus(&text)
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Malformed PROPFIND response", e))
    }

    async fn stat(&self, remote_id: &str) -> ProviderResult<DavEntry> {
        self.propfind(remote_id, 0, PROPFIND_BODY)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::new(PROVIDER_TYPE, format!("Empty PROPFIND response for {}", remote_id)))
    }

    async fn transfer(&self, method: &'static str, from: &str, to: &str, is_folder: bool) -> ProviderResult<()> {
        let method_value = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Invalid method", e))?;
        let source = self.url_for(from, is_folder)?;
        let destination = self.url_for(to, is_folder)?;
        let response = self
            .send(
                method,
                self.request(method_value, source)
                    .header("Destination", destination.as_str())
                    .header("Overwrite", "F"),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(method, response.status()));
        }
        Ok(())
    }

    fn file_metadata(&self, remote_id: String, entry: &DavEntry) -> FileMetadata {
        let name = remote_basename(&remote_id).to_string();
        FileMetadata {
            mime_type: entry
                .content_type
                .clone()
                .unwrap_or_else(|| mime::guess_from_name(&name).to_string()),
            size: entry.content_length.unwrap_or(0),
            modified_at: entry.last_modified.unwrap_or(0),
            hash: None,
            name,
            remote_id,
        }
    }
}

/// Forward a stream through a channel so the request body does not depend on
/// the source stream being `Sync`
fn streaming_body(mut data: ByteStream) -> reqwest::Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(4);
    tokio::spawn(async move {
        while let Some(chunk) = data.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}

fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut field: Option<DavField> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                b"href" => field = Some(DavField::Href),
                b"getcontentlength" => field = Some(DavField::ContentLength),
                b"getcontenttype" => field = Some(DavField::ContentType),
                b"getlastmodified" => field = Some(DavField::LastModified),
                b"quota-used-bytes" => field = Some(DavField::QuotaUsed),
                b"quota-available-bytes" => field = Some(DavField::QuotaAvailable),
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Event::Text(text) => {
                if let (Some(f), Some(entry)) = (field, current.as_mut()) {
                    let value = text.unescape()?.into_owned();
                    match f {
                        // Only the first href of a response names the resource
                        DavField::Href if entry.href.is_empty() => entry.href = value,
                        DavField::Href => {}
                        DavField::ContentLength => entry.content_length = value.parse().ok(),
                        DavField::ContentType => entry.content_type = Some(value),
                        DavField::LastModified => {
                            entry.last_modified = chrono::DateTime::parse_from_rfc2822(&value)
                                .ok()
                                .map(|dt| dt.timestamp());
                        }
                        DavField::QuotaUsed => entry.quota_used = value.parse().ok(),
                        DavField::QuotaAvailable => entry.quota_available = value.parse().ok(),
                    }
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"response" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

#[async_trait]
impl StorageProvider for WebDavProvider {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn test_connection(&self) -> ProviderResult<()> {
        let root = self.stat("").await?;
        if !root.is_collection {
            return Err(ProviderError::new(PROVIDER_TYPE, "Server root is not a collection"));
        }
        Ok(())
    }

    async fn get_quota(&self) -> ProviderResult<ProviderQuota> {
        let entry = self
            .propfind("", 0, QUOTA_BODY)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let used = entry.quota_used.unwrap_or(0);
        Ok(ProviderQuota {
            total: entry.quota_available.map(|available| used + available),
            used,
            available: entry.quota_available,
        })
    }

    async fn request_upload(&self, options: &UploadOptions) -> ProviderResult<UploadResponse> {
        let remote_id = child_remote_id(options.parent_id.as_deref(), &sanitize_filename(&options.name));
        self.url_for(&remote_id, false)?;
        Ok(UploadResponse::proxied(remote_id))
    }

    async fn upload_file(&self, remote_id: &str, data: ByteStream) -> ProviderResult<Option<String>> {
        let url = self.url_for(remote_id, false)?;
        let response = self
            .send("PUT", self.request(Method::PUT, url).body(streaming_body(data)))
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error("PUT", response.status()));
        }
        tracing::debug!(target: "providers::webdav", remote_id = %remote_id, "File uploaded");
        Ok(None)
    }

    async fn request_download(&self, remote_id: &str) -> ProviderResult<DownloadResponse> {
        self.url_for(remote_id, false)?;
        Ok(DownloadResponse::proxied(remote_id))
    }

    async fn download_file(&self, remote_id: &str) -> ProviderResult<ByteStream> {
        self.download_file_from(remote_id, 0).await
    }

    async fn download_file_from(&self, remote_id: &str, offset: u64) -> ProviderResult<ByteStream> {
        let url = self.url_for(remote_id, false)?;
        let mut builder = self.request(Method::GET, url);
        if offset > 0 {
            builder = builder.header("Range", format!("bytes={}-", offset));
        }
        let response = self.send("GET", builder).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error("GET", status));
        }

        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(io::Error::other)),
        );
        // A server that ignores Range answers 200 with the whole body
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Ok(skip_bytes(stream, offset));
        }
        Ok(stream)
    }

    async fn create_folder(&self, options: &CreateFolderOptions) -> ProviderResult<String> {
        let remote_id = child_remote_id(options.parent_id.as_deref(), &sanitize_filename(&options.name));
        let method = Method::from_bytes(b"MKCOL")
            .map_err(|e| ProviderError::with_source(PROVIDER_TYPE, "Invalid method", e))?;
        let url = self.url_for(&remote_id, true)?;
        let response = self.send("MKCOL", self.request(method, url)).await?;
        // 405 means the collection already exists
        if !response.status().is_success() && response.status() != StatusCode::METHOD_NOT_ALLOWED {
            return Err(Self::status_error("MKCOL", response.status()));
        }
        Ok(remote_id)
    }

    async fn delete(&self, options: &DeleteOptions) -> ProviderResult<()> {
        if options.remote_id.trim_matches('/').is_empty() {
            return Err(ProviderError::new(PROVIDER_TYPE, "Refusing to delete the provider root"));
        }
        let url = self.url_for(&options.remote_id, options.is_folder)?;
        let response = self.send("DELETE", self.request(Method::DELETE, url)).await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(Self::status_error("DELETE", status));
        }
        Ok(())
    }

    async fn move_item(&self, options: &MoveOptions) -> ProviderResult<String> {
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
        let is_folder = self.stat(&options.remote_id).await?.is_collection;
        self.transfer("MOVE", &options.remote_id, &new_id, is_folder).await?;
        Ok(new_id)
    }

    async fn copy(&self, options: &CopyOptions) -> ProviderResult<String> {
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
        let is_folder = self.stat(&options.remote_id).await?.is_collection;
        self.transfer("COPY", &options.remote_id, &new_id, is_folder).await?;
        Ok(new_id)
    }

    async fn list(&self, options: &ListOptions) -> ProviderResult<ListResult> {
        let folder_id = options.folder_id.as_deref().unwrap_or("").trim_matches('/');
        let offset = match options.page_token.as_deref() {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::new(PROVIDER_TYPE, format!("Invalid page token: {}", token)))?,
        };
        let limit = options.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);

        let mut children: Vec<(String, DavEntry)> = self
            .propfind(folder_id, 1, PROPFIND_BODY)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let remote_id = self.remote_id_for_href(&entry.href)?;
                (remote_id != folder_id).then_some((remote_id, entry))
            })
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let total = children.len();
        let mut result = ListResult::default();
        for (remote_id, entry) in children.into_iter().skip(offset).take(limit) {
            if entry.is_collection {
                result.folders.push(FolderMetadata {
                    name: remote_basename(&remote_id).to_string(),
                    modified_at: entry.last_modified.unwrap_or(0),
                    remote_id,
                });
            } else {
                result.files.push(self.file_metadata(remote_id, &entry));
            }
        }
        if offset + limit < total {
            result.next_page_token = Some((offset + limit).to_string());
        }
        Ok(result)
    }

    async fn get_file_metadata(&self, remote_id: &str) -> ProviderResult<FileMetadata> {
        let entry = self.stat(remote_id).await?;
        if entry.is_collection {
            return Err(ProviderError::new(PROVIDER_TYPE, format!("{} is a folder", remote_id)));
        }
        Ok(self.file_metadata(remote_id.trim_matches('/').to_string(), &entry))
    }

    async fn get_folder_metadata(&self, remote_id: &str) -> ProviderResult<FolderMetadata> {
        let entry = self.stat(remote_id).await?;
        if !entry.is_collection {
            return Err(ProviderError::new(PROVIDER_TYPE, format!("{} is not a folder", remote_id)));
        }
        Ok(FolderMetadata {
            remote_id: remote_id.trim_matches('/').to_string(),
            name: remote_basename(remote_id).to_string(),
            modified_at: entry.last_modified.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/docs/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getlastmodified>Tue, 02 Jan 2024 10:00:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/docs/My%20Notes.txt</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>42</d:getcontentlength>
        <d:getcontenttype>text/plain</d:getcontenttype>
        <d:getlastmodified>Wed, 03 Jan 2024 12:30:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <D:response xmlns:D="DAV:">
    <D:href>/dav/docs/sub/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection></D:collection></D:resourcetype></D:prop></D:propstat>
  </D:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_multistatus() {
        let entries = parse_multistatus(MULTISTATUS).unwrap();
        assert_eq!(entries.len(), 3);

        assert!(entries[0].is_collection);
        assert_eq!(entries[0].href, "/dav/docs/");

        let file = &entries[1];
        assert!(!file.is_collection);
        assert_eq!(file.content_length, Some(42));
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(file.last_modified, Some(1_704_285_000));

        assert!(entries[2].is_collection);
    }

    #[test]
    fn test_href_and_url_mapping() {
        let provider = WebDavProvider::new("https://files.example.com/dav", None, None).unwrap();
        assert_eq!(
            provider.remote_id_for_href("/dav/docs/My%20Notes.txt").as_deref(),
            Some("docs/My Notes.txt")
        );
        assert_eq!(provider.remote_id_for_href("/dav/").as_deref(), Some(""));
        assert_eq!(provider.remote_id_for_href("/other/x"), None);

        assert_eq!(
            provider.url_for("docs/My Notes.txt", false).unwrap().as_str(),
            "https://files.example.com/dav/docs/My%20Notes.txt"
        );
        assert_eq!(
            provider.url_for("docs", true).unwrap().as_str(),
            "https://files.example.com/dav/docs/"
        );
        assert!(provider.url_for("docs/../../etc", false).is_err());
    }

    #[test]
    fn test_config_requires_url() {
        assert!(WebDavProvider::from_config(&serde_json::json!({"username": "u"})).is_err());
        let provider =
            WebDavProvider::from_config(&serde_json::json!({"url": "https://h/dav/", "username": "u", "password": "p"}))
                .unwrap();
        assert_eq!(provider.provider_type(), "webdav");
        assert!(!provider.capabilities().supports_chunked_upload);
    }
}
