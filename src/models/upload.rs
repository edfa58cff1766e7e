//! Represents an in-flight blob upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session opened by `POST /v2/<name>/blobs/uploads/`.
///
/// `accepted_size` is the running byte count the backend has persisted, and is
/// what the finalizer falls back to when the client omits `Content-Length`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Upload UUID handed to the client in `Docker-Upload-UUID`.
    pub id: String,

    /// Repository the session was opened against.
    pub repository: String,

    /// Bytes accepted so far.
    pub accepted_size: i64,

    /// `open` while chunks are accepted, `completed` once the blob is committed.
    pub state: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}
