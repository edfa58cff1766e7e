//! Shared test utilities.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.
#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use blob_registry::{
    AppState, db,
    repos::{MemoryRegistry, SqliteRegistry},
    services::finalizer::BlobFinalizer,
};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A full router over a temporary SQLite database and blob directory.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let pool = open_pool(&temp_dir).await;
        let state = AppState::new(Arc::new(pool), temp_dir.path().join("blobs"));
        Self {
            router: blob_registry::app(state.clone()),
            state,
            _temp_dir: temp_dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.state.db
    }

    /// Flip a blob's status the way the garbage collector does.
    pub async fn set_blob_status(&self, digest: &str, status: &str) {
        sqlx::query("UPDATE blobs SET status = ? WHERE digest = ?")
            .bind(status)
            .bind(digest)
            .execute(self.pool())
            .await
            .expect("Failed to update blob status");
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.pool())
            .await
            .expect("Failed to count rows")
    }
}

/// Migrated single-connection pool in `dir`.
pub async fn open_pool(dir: &TempDir) -> SqlitePool {
    open_pool_with(dir, 1).await
}

/// Migrated pool in `dir` with up to `max_connections` connections.
pub async fn open_pool_with(dir: &TempDir, max_connections: u32) -> SqlitePool {
    let url = format!("sqlite://{}", dir.path().join("registry.db").display());
    let pool = db::connect(&url, max_connections)
        .await
        .expect("Failed to open database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

pub fn memory_finalizer(registry: &MemoryRegistry) -> BlobFinalizer {
    let registry = Arc::new(registry.clone());
    BlobFinalizer::new(registry.clone(), registry)
}

pub fn sqlite_finalizer(registry: &SqliteRegistry) -> BlobFinalizer {
    let registry = Arc::new(registry.clone());
    BlobFinalizer::new(registry.clone(), registry)
}

pub fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}
