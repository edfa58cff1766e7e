//! Repository traits over the shared blob metadata.
//!
//! The registry and association tables are externally owned, transactional
//! state. Callers reach them only through these narrow traits so the
//! finalization logic runs unchanged against SQLite or the in-memory fake.

use crate::models::{
    blob::{Blob, NewBlob, ProjectBlob},
    project::Project,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

/// Storage-level failure. Absence of a row is never an error; see [`Lookup`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("blob `{0}` disappeared after a conflicting insert")]
    Vanished(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Outcome of a keyed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

/// Outcome of an insert guarded by a uniqueness constraint.
///
/// `Conflict` means another writer already holds the key; it is the expected
/// result of a lost race, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert<T> {
    Inserted(T),
    Conflict,
}

/// Read and setup operations on the registry that need no transaction.
#[async_trait]
pub trait BlobRegistry: Send + Sync {
    /// Look up a blob by digest.
    async fn blob(&self, digest: &str) -> RegistryResult<Lookup<Blob>>;

    async fn project_by_name(&self, name: &str) -> RegistryResult<Lookup<Project>>;

    async fn create_project(&self, name: &str) -> RegistryResult<Insert<Project>>;

    /// Blobs associated with a project, ordered by digest.
    async fn project_blobs(&self, project_id: i64) -> RegistryResult<Vec<Blob>>;

    /// Open a transaction. Dropping it without `commit` discards its writes.
    async fn begin(&self) -> RegistryResult<Box<dyn RegistryTx>>;
}

/// Operations available inside a single transaction.
#[async_trait]
pub trait RegistryTx: Send {
    async fn blob(&mut self, digest: &str) -> RegistryResult<Lookup<Blob>>;

    /// Insert a blob row. A digest uniqueness violation yields `Insert::Conflict`.
    async fn insert_blob(&mut self, blob: &NewBlob) -> RegistryResult<Insert<Blob>>;

    /// Move a `none`/`pending` row to `success`. Rows in other states are untouched.
    async fn mark_blob_success(&mut self, blob_id: i64) -> RegistryResult<()>;

    /// Link a blob to a project. An existing link yields `Insert::Conflict`.
    async fn associate(
        &mut self,
        project_id: i64,
        blob_id: i64,
    ) -> RegistryResult<Insert<ProjectBlob>>;

    async fn commit(self: Box<Self>) -> RegistryResult<()>;

    async fn rollback(self: Box<Self>) -> RegistryResult<()>;
}

/// Read-only view of in-flight upload sessions.
#[async_trait]
pub trait UploadSessionTracker: Send + Sync {
    /// Bytes the backend accepted for `session_id`.
    async fn accepted_size(&self, session_id: &str) -> RegistryResult<Lookup<i64>>;
}

pub type BlobRegistryRef = Arc<dyn BlobRegistry>;
pub type UploadSessionTrackerRef = Arc<dyn UploadSessionTracker>;
