//! Blob bookkeeping around the proxied distribution requests.
//!
//! - `PUT .../blobs/uploads/{session}`: refuse digests being garbage collected,
//!   then register the blob and link it to the project once the backend
//!   answers `201 Created`.
//! - `POST .../blobs/uploads/?mount=...`: refuse deleting mount sources, then
//!   link the mounted blob to the project on `201 Created`.
//! - `HEAD` and `GET .../blobs/{digest}`: refuse probes and downloads of
//!   deleting blobs. A client told "exists" would skip an upload the collector
//!   is about to invalidate.

use crate::{
    distribution::{DOCKER_CONTENT_DIGEST, RegistryRoute, UploadQuery, parse_project_name},
    errors::AppError,
    middleware::timing::timed,
    services::finalizer::{BlobFinalizer, CompletedUpload},
    state::AppState,
};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

pub async fn blob_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let result = match RegistryRoute::parse(request.method(), request.uri().path()) {
        Some(RegistryRoute::CompleteUpload {
            repository,
            session_id,
        }) => put_blob_upload(&state.finalizer, &repository, session_id, request, next).await,
        Some(RegistryRoute::InitiateUpload { repository }) => {
            post_initiate_blob_upload(&state.finalizer, &repository, request, next).await
        }
        Some(RegistryRoute::HeadBlob { digest, .. }) => {
            serve_blob("head_blob", &state.finalizer, &digest, request, next).await
        }
        Some(RegistryRoute::GetBlob { digest, .. }) => {
            serve_blob("get_blob", &state.finalizer, &digest, request, next).await
        }
        _ => Ok(next.run(request).await),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

async fn put_blob_upload(
    finalizer: &BlobFinalizer,
    repository: &str,
    session_id: String,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = request.method().clone();
    let url = request.uri().path().to_string();
    let digest = UploadQuery::from_uri(request.uri())
        .digest
        .unwrap_or_default();

    timed(
        "put_blob_upload",
        "before request",
        &method,
        &url,
        finalizer.check_not_deleting(&digest),
    )
    .await?;

    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let response = next.run(request).await;

    let upload = CompletedUpload {
        project: parse_project_name(repository).to_string(),
        session_id,
        digest: response_digest(&response),
        content_length,
    };
    timed(
        "put_blob_upload",
        "after response",
        &method,
        &url,
        finalizer.finalize_upload(response.status(), &upload),
    )
    .await?;

    Ok(response)
}

async fn post_initiate_blob_upload(
    finalizer: &BlobFinalizer,
    repository: &str,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = request.method().clone();
    let url = request.uri().path().to_string();
    let mount = UploadQuery::from_uri(request.uri()).mount;

    if let Some(digest) = mount.as_deref() {
        timed(
            "post_initiate_blob_upload",
            "before request",
            &method,
            &url,
            finalizer.check_not_deleting(digest),
        )
        .await?;
    }

    let response = next.run(request).await;

    timed(
        "post_initiate_blob_upload",
        "after response",
        &method,
        &url,
        finalizer.finalize_mount(
            response.status(),
            parse_project_name(repository),
            mount.as_deref(),
        ),
    )
    .await?;

    Ok(response)
}

async fn serve_blob(
    action: &'static str,
    finalizer: &BlobFinalizer,
    digest: &str,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = request.method().clone();
    let url = request.uri().path().to_string();
    timed(
        action,
        "before request",
        &method,
        &url,
        finalizer.check_not_deleting(digest),
    )
    .await?;
    Ok(next.run(request).await)
}

/// Digest the backend assigned, read from the response rather than the request.
fn response_digest(response: &Response) -> String {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
