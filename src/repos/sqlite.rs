//! SQLite-backed registry.
//!
//! Uniqueness of `blobs.digest` and `(project_blobs.project_id, blob_id)` is
//! enforced by the schema; concurrent finalizers rely on it rather than on any
//! in-process lock.

use super::{
    BlobRegistry, Insert, Lookup, RegistryResult, RegistryTx, UploadSessionTracker,
};
use crate::models::{
    blob::{Blob, NewBlob, ProjectBlob},
    project::Project,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct SqliteRegistry {
    db: Arc<SqlitePool>,
}

impl SqliteRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }
}

#[async_trait]
impl BlobRegistry for SqliteRegistry {
    async fn blob(&self, digest: &str) -> RegistryResult<Lookup<Blob>> {
        let row = sqlx::query_as::<_, Blob>(
            "SELECT id, digest, content_type, size, status, created_at, updated_at
             FROM blobs WHERE digest = ?",
        )
        .bind(digest)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row.map_or(Lookup::NotFound, Lookup::Found))
    }

    async fn project_by_name(&self, name: &str) -> RegistryResult<Lookup<Project>> {
        let row = sqlx::query_as::<_, Project>(
            "SELECT id, name, created_at FROM projects WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row.map_or(Lookup::NotFound, Lookup::Found))
    }

    async fn create_project(&self, name: &str) -> RegistryResult<Insert<Project>> {
        let result = sqlx::query_as::<_, Project>(
            "INSERT INTO projects (name, created_at) VALUES (?, ?)
             RETURNING id, name, created_at",
        )
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match result {
            Ok(project) => Ok(Insert::Inserted(project)),
            Err(err) if is_unique_violation(&err) => Ok(Insert::Conflict),
            Err(err) => Err(err.into()),
        }
    }

    async fn project_blobs(&self, project_id: i64) -> RegistryResult<Vec<Blob>> {
        let rows = sqlx::query_as::<_, Blob>(
            "SELECT b.id, b.digest, b.content_type, b.size, b.status, b.created_at, b.updated_at
             FROM blobs b
             JOIN project_blobs pb ON pb.blob_id = b.id
             WHERE pb.project_id = ?
             ORDER BY b.digest ASC",
        )
        .bind(project_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn begin(&self) -> RegistryResult<Box<dyn RegistryTx>> {
        let tx = self.db.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

#[async_trait]
impl UploadSessionTracker for SqliteRegistry {
    async fn accepted_size(&self, session_id: &str) -> RegistryResult<Lookup<i64>> {
        let size = sqlx::query_scalar::<_, i64>(
            "SELECT accepted_size FROM upload_sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(size.map_or(Lookup::NotFound, Lookup::Found))
    }
}

/// One open SQLite transaction. sqlx rolls it back on drop if not committed.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl RegistryTx for SqliteTx {
    async fn blob(&mut self, digest: &str) -> RegistryResult<Lookup<Blob>> {
        let row = sqlx::query_as::<_, Blob>(
            "SELECT id, digest, content_type, size, status, created_at, updated_at
             FROM blobs WHERE digest = ?",
        )
        .bind(digest)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map_or(Lookup::NotFound, Lookup::Found))
    }

    async fn insert_blob(&mut self, blob: &NewBlob) -> RegistryResult<Insert<Blob>> {
        let now = Utc::now();
        let result = sqlx::query_as::<_, Blob>(
            "INSERT INTO blobs (digest, content_type, size, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id, digest, content_type, size, status, created_at, updated_at",
        )
        .bind(&blob.digest)
        .bind(&blob.content_type)
        .bind(blob.size)
        .bind(blob.status)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await;

        match result {
            Ok(row) => Ok(Insert::Inserted(row)),
            Err(err) if is_unique_violation(&err) => {
                debug!(digest = %blob.digest, "blob insert lost uniqueness race");
                Ok(Insert::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_blob_success(&mut self, blob_id: i64) -> RegistryResult<()> {
        sqlx::query(
            "UPDATE blobs SET status = 'success', updated_at = ?
             WHERE id = ? AND status IN ('none', 'pending')",
        )
        .bind(Utc::now())
        .bind(blob_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn associate(
        &mut self,
        project_id: i64,
        blob_id: i64,
    ) -> RegistryResult<Insert<ProjectBlob>> {
        let row = sqlx::query_as::<_, ProjectBlob>(
            "INSERT INTO project_blobs (project_id, blob_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT (project_id, blob_id) DO NOTHING
             RETURNING id, project_id, blob_id, created_at",
        )
        .bind(project_id)
        .bind(blob_id)
        .bind(Utc::now())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map_or(Insert::Conflict, Insert::Inserted))
    }

    async fn commit(self: Box<Self>) -> RegistryResult<()> {
        let SqliteTx { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RegistryResult<()> {
        let SqliteTx { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
