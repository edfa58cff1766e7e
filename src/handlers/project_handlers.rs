//! Project management and association listing.

use crate::{
    distribution::is_valid_repository,
    errors::AppError,
    models::blob::Blob,
    repos::{Insert, Lookup},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

/// `PUT /api/projects/{name}`
pub async fn create_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if name.contains('/') || !is_valid_repository(&name) {
        return Err(AppError::bad_request(format!(
            "project name `{name}` is invalid"
        )));
    }

    match state.finalizer.registry().create_project(&name).await? {
        Insert::Inserted(project) => {
            tracing::info!(project = %project.name, id = project.id, "created project");
            Ok((StatusCode::CREATED, Json(project)))
        }
        Insert::Conflict => Err(AppError::conflict(format!(
            "project `{name}` already exists"
        ))),
    }
}

/// `GET /api/projects/{name}/blobs`
pub async fn list_project_blobs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Blob>>, AppError> {
    let registry = state.finalizer.registry();
    let project = match registry.project_by_name(&name).await? {
        Lookup::Found(project) => project,
        Lookup::NotFound => {
            return Err(AppError::not_found(format!("project `{name}` not found")));
        }
    };
    Ok(Json(registry.project_blobs(project.id).await?))
}
