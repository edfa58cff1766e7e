//! Represents a content-addressed blob and its association to projects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Media type recorded when the upload path does not carry one.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Lifecycle state of a blob row.
///
/// `Pending -> Success` happens only through the finalizer's ensure step.
/// `Success -> Deleting -> (removed)` is owned by the garbage collector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BlobStatus {
    None,
    Pending,
    Success,
    Deleting,
}

/// A blob known to the registry, keyed uniquely by digest.
///
/// The struct stores metadata only; payload bytes live in the blob backend.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Blob {
    /// Row identity, stable for the lifetime of the digest.
    pub id: i64,

    /// Content digest, e.g. `sha256:<hex>`.
    pub digest: String,

    /// Informational media type.
    pub content_type: String,

    /// Size in bytes, set once at creation.
    pub size: i64,

    pub status: BlobStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Values for a blob row that does not exist yet.
#[derive(Clone, Debug)]
pub struct NewBlob {
    pub digest: String,
    pub content_type: String,
    pub size: i64,
    pub status: BlobStatus,
}

/// Link between a project and a blob. Never updated once written.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ProjectBlob {
    pub id: i64,
    pub project_id: i64,
    pub blob_id: i64,
    pub created_at: DateTime<Utc>,
}
