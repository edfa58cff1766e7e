//! Represents a project, the namespace that owns repositories and blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A project in the registry.
///
/// The first path component of a repository name (`<project>/<repo>`) selects it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Project {
    /// Internal row identifier.
    pub id: i64,

    /// Unique project name.
    pub name: String,

    /// When this project was created.
    pub created_at: DateTime<Utc>,
}
