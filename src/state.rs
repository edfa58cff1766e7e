//! Shared application state.

use crate::{
    repos::SqliteRegistry,
    services::{blob_backend::BlobBackend, finalizer::BlobFinalizer},
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub backend: BlobBackend,
    pub finalizer: BlobFinalizer,
}

impl AppState {
    /// Wire the SQLite registry, session tracker and disk backend over one pool.
    pub fn new(db: Arc<SqlitePool>, storage_dir: impl Into<PathBuf>) -> Self {
        let registry = Arc::new(SqliteRegistry::new(db.clone()));
        Self {
            backend: BlobBackend::new(db.clone(), storage_dir),
            finalizer: BlobFinalizer::new(registry.clone(), registry),
            db,
        }
    }
}
