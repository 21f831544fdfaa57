use crate::uploader::ReceiveChunkResult;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Deserialize;
use std::io;

use super::{ApiResponse, AppError, AppState};

/// Header carrying the caller's workspace on proxy requests
const WORKSPACE_HEADER: &str = "x-workspace-id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkQuery {
    pub session_id: String,
    pub chunk_index: u32,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    pub file_id: Option<String>,
}

impl FileQuery {
    fn require(self) -> Result<String, AppError> {
        self.file_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::BadRequest("Missing fileId".into()))
    }
}

fn workspace_of(headers: &HeaderMap) -> Option<&str> {
    headers.get(WORKSPACE_HEADER).and_then(|v| v.to_str().ok())
}

/// Health check endpoint
pub async fn health_check() -> Json<ApiResponse<serde_json::Value>> {
    tracing::debug!(target: "api::health", "Health check requested");
    Json(ApiResponse::success(serde_json::json!({
        "status": "healthy",
        "service": "drivebase-engine"
    })))
}

/// Receive one raw chunk of a chunked upload session
pub async fn upload_chunk(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<ReceiveChunkResult>, AppError> {
    tracing::debug!(
        target: "api::upload",
        session_id = %query.session_id,
        chunk_index = query.chunk_index,
        bytes = body.len(),
        "Chunk received"
    );
    let result = state
        .uploads
        .receive_chunk(&query.session_id, query.chunk_index, body, &query.user_id)
        .await?;
    Ok(Json(result))
}

/// Stream the request body to the file's provider
pub async fn upload_proxy(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<serde_json::Value>, AppError> {
    let file_id = query.require()?;
    tracing::debug!(target: "api::upload", file_id = %file_id, "Proxy upload started");

    let stream = body.into_data_stream().map_err(io::Error::other);
    let file = state
        .files
        .proxy_upload(&file_id, workspace_of(&headers), Box::pin(stream))
        .await?;

    tracing::info!(target: "api::upload", file_id = %file.id, "Proxy upload success");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Stream a file from its provider as an attachment
pub async fn download_proxy(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let file_id = query.require()?;
    tracing::debug!(target: "api::download", file_id = %file_id, "Proxy download started");

    let (file, stream) = state.files.proxy_download(&file_id, workspace_of(&headers)).await?;

    let content_type = if file.mime_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        file.mime_type.clone()
    };
    let disposition = format!("attachment; filename*=UTF-8''{}", urlencoding::encode(&file.name));

    let mut response = Body::from_stream(stream).into_response();
    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::api_fixture;
    use crate::error::EngineError;
    use crate::files::PrepareUpload;
    use crate::tasks::QueueJobStatus;
    use crate::uploader::CreateSessionParams;
    use axum::http::StatusCode;

    fn chunk(session_id: &str, index: u32) -> Query<ChunkQuery> {
        Query(ChunkQuery {
            session_id: session_id.into(),
            chunk_index: index,
            user_id: "alice".into(),
        })
    }

    fn file_query(id: &str) -> Query<FileQuery> {
        Query(FileQuery {
            file_id: Some(id.into()),
        })
    }

    #[tokio::test]
    async fn test_chunk_endpoint_reports_completion() {
        let fx = api_fixture();
        let created = fx
            .state
            .uploads
            .create_session(CreateSessionParams {
                file_name: "a.bin".into(),
                mime_type: "application/octet-stream".into(),
                total_size: 8,
                chunk_size: Some(4),
                provider_id: "p1".into(),
                folder_id: None,
                user_id: "alice".into(),
                file_id: "f1".into(),
            })
            .await
            .unwrap();

        let Json(first) = upload_chunk(State(fx.state.clone()), chunk(&created.session_id, 0), Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        assert!(!first.is_complete);

        let Json(last) = upload_chunk(State(fx.state.clone()), chunk(&created.session_id, 1), Bytes::from_static(b"efgh"))
            .await
            .unwrap();
        assert!(last.is_complete);
        assert_eq!(last.chunk_index, 1);
        assert_eq!(
            serde_json::to_value(&last).unwrap(),
            serde_json::json!({ "isComplete": true, "chunkIndex": 1 })
        );
        assert_eq!(fx.queue.count(QueueJobStatus::Waiting).unwrap(), 1);

        let err = upload_chunk(State(fx.state.clone()), chunk("missing", 0), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_endpoints_stream_bytes() {
        let fx = api_fixture();
        let prepared = fx
            .state
            .files
            .prepare_upload(PrepareUpload {
                workspace_id: "ws".into(),
                user_id: "alice".into(),
                name: "report final.txt".into(),
                mime_type: "text/plain".into(),
                size: 5,
                folder_id: None,
                provider_id: "p1".into(),
            })
            .await
            .unwrap();

        upload_proxy(
            State(fx.state.clone()),
            file_query(&prepared.file.id),
            HeaderMap::new(),
            Body::from("hello"),
        )
        .await
        .unwrap();
        assert_eq!(fx.provider.file("report final.txt").unwrap(), b"hello");

        let response = download_proxy(State(fx.state.clone()), file_query(&prepared.file.id), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename*=UTF-8''report%20final.txt"
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_proxy_rejects_missing_or_foreign_file() {
        let fx = api_fixture();
        let missing = download_proxy(State(fx.state.clone()), Query(FileQuery { file_id: None }), HeaderMap::new())
            .await
            .err()
            .expect("missing fileId is rejected");
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let prepared = fx
            .state
            .files
            .prepare_upload(PrepareUpload {
                workspace_id: "ws".into(),
                user_id: "alice".into(),
                name: "a.txt".into(),
                mime_type: "text/plain".into(),
                size: 1,
                folder_id: None,
                provider_id: "p1".into(),
            })
            .await
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(WORKSPACE_HEADER, HeaderValue::from_static("other"));
        let foreign = download_proxy(State(fx.state.clone()), file_query(&prepared.file.id), headers)
            .await
            .err()
            .expect("foreign workspace is rejected");
        assert!(matches!(foreign, AppError::Engine(EngineError::NotFound(_))));
        assert!(fx.db.get_file(&prepared.file.id).unwrap().is_some());
    }
}
