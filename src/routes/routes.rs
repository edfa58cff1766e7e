//! Route table.
//!
//! - **Distribution endpoints** (wrapped by `middleware::blob`)
//!   - `GET   /v2/`
//!   - `POST  /v2/{name}/blobs/uploads/` — start upload or mount (`?mount=&from=`)
//!   - `PATCH /v2/{name}/blobs/uploads/{session}` — append chunk
//!   - `PUT   /v2/{name}/blobs/uploads/{session}?digest=` — complete upload
//!   - `HEAD  /v2/{name}/blobs/{digest}`, `GET` the same
//!
//! - **Project endpoints**
//!   - `PUT /api/projects/{name}` — create project
//!   - `GET /api/projects/{name}/blobs` — list associated blobs
//!
//! `{name}` may span several path segments, so the distribution side is one
//! wildcard route dispatched by `distribution::RegistryRoute`.

use crate::{
    handlers::{
        blob_handlers::registry_dispatch,
        health_handlers::{healthz, readyz},
        project_handlers::{create_project, list_project_blobs},
    },
    middleware::blob::blob_middleware,
    state::AppState,
};
use axum::{
    Router, middleware,
    routing::{any, get, put},
};

/// Build the full router with state applied.
pub fn routes(state: AppState) -> Router {
    let registry = Router::new()
        .route("/v2/", any(registry_dispatch))
        .route("/v2/{*path}", any(registry_dispatch))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            blob_middleware,
        ));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/projects/{name}", put(create_project))
        .route("/api/projects/{name}/blobs", get(list_project_blobs))
        .merge(registry)
        .with_state(state)
}
