//! HTTP handlers for the distribution blob endpoints.
//! Request bodies are streamed straight into `BlobBackend`; registry
//! bookkeeping happens in `middleware::blob`, not here.

use crate::{
    distribution::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, RegistryRoute, UploadQuery},
    errors::AppError,
    models::{blob::DEFAULT_MEDIA_TYPE, upload::UploadSession},
    services::blob_backend::BlobBackend,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::io;
use tokio_util::io::ReaderStream;

/// Entry point for every `/v2/...` request.
pub async fn registry_dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Body,
) -> Result<Response, AppError> {
    let route = RegistryRoute::parse(&method, uri.path())
        .ok_or_else(|| AppError::not_found(format!("unsupported endpoint {method} {}", uri.path())))?;
    let query = UploadQuery::from_uri(&uri);
    let backend = &state.backend;

    match route {
        RegistryRoute::Base => Ok(Json(json!({})).into_response()),
        RegistryRoute::InitiateUpload { repository } => {
            initiate_upload(backend, &repository, query).await
        }
        RegistryRoute::PatchUpload {
            repository,
            session_id,
        } => {
            let session = backend
                .append_chunk(&session_id, body_stream(body))
                .await?;
            Ok(upload_progress(&repository, &session, StatusCode::ACCEPTED))
        }
        RegistryRoute::CompleteUpload {
            repository,
            session_id,
        } => {
            let digest = query
                .digest
                .ok_or_else(|| AppError::bad_request("digest query parameter is required"))?;
            let committed = backend
                .complete_upload(&session_id, &digest, body_stream(body))
                .await?;
            Ok(blob_created(&repository, &committed.digest))
        }
        RegistryRoute::HeadBlob { digest, .. } => match backend.stat_blob(&digest).await? {
            Some(size) => {
                let mut response = Response::new(Body::empty());
                set_blob_headers(response.headers_mut(), &digest, size);
                Ok(response)
            }
            None => Err(AppError::not_found(format!("blob `{digest}` not found"))),
        },
        RegistryRoute::GetBlob { digest, .. } => {
            let (size, file) = backend.open_blob(&digest).await?;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
            set_blob_headers(response.headers_mut(), &digest, size);
            Ok(response)
        }
    }
}

/// `POST /v2/{name}/blobs/uploads/` — mount when the source blob exists,
/// otherwise open a fresh upload session.
async fn initiate_upload(
    backend: &BlobBackend,
    repository: &str,
    query: UploadQuery,
) -> Result<Response, AppError> {
    if let Some(mount) = query.mount.as_deref() {
        if backend.stat_blob(mount).await?.is_some() {
            tracing::debug!(%mount, from = ?query.from, %repository, "mounted blob");
            return Ok(blob_created(repository, mount));
        }
        tracing::debug!(%mount, %repository, "mount source missing, starting upload");
    }

    let session = backend.start_upload(repository).await?;
    Ok(upload_progress(repository, &session, StatusCode::ACCEPTED))
}

fn body_stream(body: Body) -> impl Stream<Item = io::Result<Bytes>> + Send {
    body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other))
}

fn upload_progress(repository: &str, session: &UploadSession, status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    insert_header(
        headers,
        header::LOCATION,
        &format!("/v2/{repository}/blobs/uploads/{}", session.id),
    );
    insert_header(
        headers,
        HeaderName::from_static(DOCKER_UPLOAD_UUID),
        &session.id,
    );
    if session.accepted_size > 0 {
        insert_header(
            headers,
            header::RANGE,
            &format!("0-{}", session.accepted_size - 1),
        );
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

fn blob_created(repository: &str, digest: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    let headers = response.headers_mut();
    insert_header(
        headers,
        header::LOCATION,
        &format!("/v2/{repository}/blobs/{digest}"),
    );
    insert_header(headers, HeaderName::from_static(DOCKER_CONTENT_DIGEST), digest);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

fn set_blob_headers(headers: &mut HeaderMap, digest: &str, size: i64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DEFAULT_MEDIA_TYPE),
    );
    insert_header(headers, header::CONTENT_LENGTH, &size.max(0).to_string());
    insert_header(headers, HeaderName::from_static(DOCKER_CONTENT_DIGEST), digest);
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
