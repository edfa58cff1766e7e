//! src/services/blob_backend.rs
//!
//! BlobBackend — local stand-in for the distribution storage driver. Upload
//! sessions are tracked in SQLite (`upload_sessions`), chunk payloads are
//! appended to `base_path/uploads/{session}/data`, and committed blobs live at
//! `base_path/blobs/sha256/{aa}/{hex}/data`. The backend verifies digests; it
//! knows nothing about projects or blob registry rows.

use crate::{
    distribution::{sha256_digest, sha256_hex},
    models::upload::UploadSession,
};
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use futures::{Stream, StreamExt, pin_mut};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const HASH_BUFFER_LEN: usize = 64 * 1024;

/// How long a completed session row is kept after its final `PUT`.
pub const COMPLETED_SESSION_RETENTION: TimeDelta = TimeDelta::hours(24);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("upload `{0}` not found")]
    UploadUnknown(String),
    #[error("blob `{0}` not found")]
    BlobUnknown(String),
    #[error("digest `{0}` is invalid or unsupported")]
    DigestInvalid(String),
    #[error("digest mismatch: declared `{declared}`, computed `{computed}`")]
    DigestMismatch { declared: String, computed: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A blob payload committed to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlob {
    pub digest: String,
    pub size: i64,
}

#[derive(Clone)]
pub struct BlobBackend {
    /// Shared SQLite pool; only `upload_sessions` is touched here.
    pub db: Arc<SqlitePool>,

    /// Root directory for upload scratch files and committed blobs.
    pub base_path: PathBuf,
}

impl BlobBackend {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    fn blob_path(&self, hex: &str) -> PathBuf {
        let mut path = self.base_path.join("blobs").join("sha256");
        path.push(&hex[..2]);
        path.push(hex);
        path.push("data");
        path
    }

    fn upload_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join("uploads").join(session_id)
    }

    /// Fetch an open session. Ids that are not UUIDs never reach the filesystem.
    async fn fetch_open_session(&self, session_id: &str) -> BackendResult<UploadSession> {
        if Uuid::parse_str(session_id).is_err() {
            return Err(BackendError::UploadUnknown(session_id.to_string()));
        }
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, repository, accepted_size, state, created_at, updated_at
             FROM upload_sessions WHERE id = ? AND state = 'open'",
        )
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| BackendError::UploadUnknown(session_id.to_string()))
    }

    /// Open a new upload session for `repository`.
    pub async fn start_upload(&self, repository: &str) -> BackendResult<UploadSession> {
        self.prune_completed_sessions().await?;

        let id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.upload_dir(&id)).await?;

        let now = Utc::now();
        let session = sqlx::query_as::<_, UploadSession>(
            "INSERT INTO upload_sessions (id, repository, accepted_size, state, created_at, updated_at)
             VALUES (?, ?, 0, 'open', ?, ?)
             RETURNING id, repository, accepted_size, state, created_at, updated_at",
        )
        .bind(&id)
        .bind(repository)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        debug!(session = %session.id, %repository, "started upload session");
        Ok(session)
    }

    /// Append a chunk to an open session and record the new accepted size.
    pub async fn append_chunk<S>(&self, session_id: &str, stream: S) -> BackendResult<UploadSession>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.fetch_open_session(session_id).await?;
        let written = self.write_stream(session_id, stream).await?;

        let session = sqlx::query_as::<_, UploadSession>(
            "UPDATE upload_sessions SET accepted_size = accepted_size + ?, updated_at = ?
             WHERE id = ? AND state = 'open'
             RETURNING id, repository, accepted_size, state, created_at, updated_at",
        )
        .bind(written)
        .bind(Utc::now())
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| BackendError::UploadUnknown(session_id.to_string()))?;
        Ok(session)
    }

    /// Append the final chunk, verify `digest` against the payload and move it
    /// into blob storage. An existing payload for the same digest is kept.
    pub async fn complete_upload<S>(
        &self,
        session_id: &str,
        digest: &str,
        stream: S,
    ) -> BackendResult<CommittedBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let declared_hex =
            sha256_hex(digest).ok_or_else(|| BackendError::DigestInvalid(digest.to_string()))?;
        let session = self.fetch_open_session(session_id).await?;
        let written = self.write_stream(session_id, stream).await?;
        let size = session.accepted_size + written;

        let upload_dir = self.upload_dir(session_id);
        let data_path = upload_dir.join("data");
        let computed = hash_file(&data_path).await?;
        if computed != declared_hex {
            // Drop the rejected chunk so the session can take a corrected retry.
            OpenOptions::new()
                .write(true)
                .open(&data_path)
                .await?
                .set_len(session.accepted_size as u64)
                .await?;
            return Err(BackendError::DigestMismatch {
                declared: digest.to_string(),
                computed: sha256_digest(&computed),
            });
        }

        let blob_path = self.blob_path(declared_hex);
        if fs::try_exists(&blob_path).await? {
            debug!(%digest, "blob payload already present, dropping upload copy");
            fs::remove_file(&data_path).await?;
        } else {
            if let Some(parent) = blob_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&data_path, &blob_path).await?;
        }
        self.prune_empty_dirs(&upload_dir, &self.base_path.join("uploads"))
            .await;

        sqlx::query(
            "UPDATE upload_sessions SET state = 'completed', accepted_size = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(size)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&*self.db)
        .await?;

        Ok(CommittedBlob {
            digest: digest.to_string(),
            size,
        })
    }

    /// Delete completed session rows past [`COMPLETED_SESSION_RETENTION`].
    ///
    /// Completed rows outlive the upload so the finalizer can still read the
    /// accepted size after the backend has answered.
    pub async fn prune_completed_sessions(&self) -> BackendResult<u64> {
        let cutoff = Utc::now() - COMPLETED_SESSION_RETENTION;
        let pruned = sqlx::query(
            "DELETE FROM upload_sessions WHERE state = 'completed' AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&*self.db)
        .await?
        .rows_affected();
        if pruned > 0 {
            debug!(pruned, "pruned completed upload sessions");
        }
        Ok(pruned)
    }

    /// Size of a committed blob, or `None` if no payload exists.
    pub async fn stat_blob(&self, digest: &str) -> BackendResult<Option<i64>> {
        let hex =
            sha256_hex(digest).ok_or_else(|| BackendError::DigestInvalid(digest.to_string()))?;
        match fs::metadata(self.blob_path(hex)).await {
            Ok(meta) => Ok(Some(meta.len() as i64)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Open a committed blob for streaming out.
    pub async fn open_blob(&self, digest: &str) -> BackendResult<(i64, File)> {
        let hex =
            sha256_hex(digest).ok_or_else(|| BackendError::DigestInvalid(digest.to_string()))?;
        let file = File::open(self.blob_path(hex)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::BlobUnknown(digest.to_string())
            } else {
                BackendError::Io(err)
            }
        })?;
        let size = file.metadata().await?.len() as i64;
        Ok((size, file))
    }

    /// Stream bytes onto the end of the session's scratch file, fsyncing before return.
    async fn write_stream<S>(&self, session_id: &str, stream: S) -> BackendResult<i64>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let upload_dir = self.upload_dir(session_id);
        fs::create_dir_all(&upload_dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(upload_dir.join("data"))
            .await?;

        let mut written: i64 = 0;
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as i64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Lowercase hex sha256 of a file's contents.
async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_LEN];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
