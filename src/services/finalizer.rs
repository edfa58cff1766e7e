//! Blob upload finalization.
//!
//! Runs around the proxied transfer: a guard before the request is forwarded,
//! and an ensure-then-associate sequence after the backend reports `201
//! Created`. The ensure/associate pair shares one registry transaction, and
//! digest uniqueness in storage is what makes concurrent pushes of the same
//! content converge on a single blob row.

use crate::{
    models::{
        blob::{Blob, BlobStatus, DEFAULT_MEDIA_TYPE, NewBlob},
        project::Project,
    },
    repos::{
        BlobRegistryRef, Insert, Lookup, RegistryError, RegistryTx, UploadSessionTrackerRef,
    },
};
use axum::http::StatusCode;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("lookup failed: {0}")]
    LookupFailed(#[source] RegistryError),

    #[error("blob `{digest}` is being deleted, retry later")]
    ConflictingState { digest: String },

    #[error("unable to determine size of upload `{session_id}`")]
    SizeUnresolved { session_id: String },

    #[error("project `{0}` not found")]
    ProjectNotFound(String),

    #[error("blob `{0}` not found")]
    BlobUnknown(String),

    #[error("backend response carried no content digest")]
    DigestMissing,

    #[error("ensure blob `{digest}` failed: {source}")]
    EnsureFailed {
        digest: String,
        #[source]
        source: RegistryError,
    },

    #[error("associate blob `{digest}` with project `{project}` failed: {source}")]
    AssociateFailed {
        digest: String,
        project: String,
        #[source]
        source: RegistryError,
    },

    #[error("transaction failed: {0}")]
    Transaction(#[source] RegistryError),
}

pub type FinalizeResult<T> = Result<T, FinalizeError>;

/// What the upload finalizer needs from a completed `PUT` exchange.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    /// Project parsed from the request path.
    pub project: String,
    /// Upload session parsed from the request path.
    pub session_id: String,
    /// Digest from the backend's `Docker-Content-Digest` response header.
    pub digest: String,
    /// Raw `Content-Length` of the request, if any.
    pub content_length: Option<String>,
}

#[derive(Clone)]
pub struct BlobFinalizer {
    registry: BlobRegistryRef,
    sessions: UploadSessionTrackerRef,
}

impl BlobFinalizer {
    pub fn new(registry: BlobRegistryRef, sessions: UploadSessionTrackerRef) -> Self {
        Self { registry, sessions }
    }

    pub fn registry(&self) -> &BlobRegistryRef {
        &self.registry
    }

    /// Reject requests that target a blob the garbage collector has claimed.
    ///
    /// An empty digest (not declared yet) passes. Lookup errors fail closed.
    pub async fn check_not_deleting(&self, digest: &str) -> FinalizeResult<()> {
        if digest.is_empty() {
            return Ok(());
        }
        match self.registry.blob(digest).await {
            Ok(Lookup::Found(blob)) if blob.status == BlobStatus::Deleting => {
                warn!(%digest, "blob is marked for deletion, rejecting request");
                Err(FinalizeError::ConflictingState {
                    digest: digest.to_string(),
                })
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(%digest, error = %err, "blob status lookup failed");
                Err(FinalizeError::LookupFailed(err))
            }
        }
    }

    /// Size of the uploaded blob: the declared `Content-Length` when it parses
    /// to a non-zero value, otherwise the session tracker's accepted size.
    pub async fn resolve_size(
        &self,
        content_length: Option<&str>,
        session_id: &str,
    ) -> FinalizeResult<i64> {
        let declared = content_length
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|size| *size > 0);
        if let Some(size) = declared {
            return Ok(size);
        }

        match self.sessions.accepted_size(session_id).await {
            Ok(Lookup::Found(size)) => Ok(size),
            Ok(Lookup::NotFound) => Err(FinalizeError::SizeUnresolved {
                session_id: session_id.to_string(),
            }),
            Err(err) => {
                error!(%session_id, error = %err, "get blob size failed");
                Err(FinalizeError::LookupFailed(err))
            }
        }
    }

    /// Register the blob created by a completed upload and link it to the
    /// project. Does nothing unless `status` is `201 Created`.
    pub async fn finalize_upload(
        &self,
        status: StatusCode,
        upload: &CompletedUpload,
    ) -> FinalizeResult<Option<Blob>> {
        if status != StatusCode::CREATED {
            return Ok(None);
        }
        if upload.digest.is_empty() {
            return Err(FinalizeError::DigestMissing);
        }

        let size = self
            .resolve_size(upload.content_length.as_deref(), &upload.session_id)
            .await?;
        let project = self.project(&upload.project).await?;

        let mut tx = self.registry.begin().await.map_err(FinalizeError::Transaction)?;
        let outcome = async {
            let blob = ensure(tx.as_mut(), &upload.digest, DEFAULT_MEDIA_TYPE, size).await?;
            associate(tx.as_mut(), &blob, &project).await?;
            Ok::<_, FinalizeError>(blob)
        }
        .await;

        let blob = finish(tx, outcome).await?;
        info!(digest = %blob.digest, size = blob.size, project = %project.name, "blob upload finalized");
        Ok(Some(blob))
    }

    /// Link an existing blob to the project after a successful cross-repository
    /// mount. Never creates or modifies the blob row, so only a blob already
    /// marked `success` is linked.
    ///
    /// Does nothing unless `status` is `201 Created` and `mount` is present.
    pub async fn finalize_mount(
        &self,
        status: StatusCode,
        project: &str,
        mount: Option<&str>,
    ) -> FinalizeResult<Option<Blob>> {
        if status != StatusCode::CREATED {
            return Ok(None);
        }
        let Some(digest) = mount.filter(|digest| !digest.is_empty()) else {
            return Ok(None);
        };

        let project = self.project(project).await?;

        let mut tx = self.registry.begin().await.map_err(FinalizeError::Transaction)?;
        let outcome = async {
            let blob = match tx.blob(digest).await.map_err(FinalizeError::LookupFailed)? {
                Lookup::Found(blob) if blob.status == BlobStatus::Deleting => {
                    return Err(FinalizeError::ConflictingState {
                        digest: digest.to_string(),
                    });
                }
                Lookup::Found(blob) if blob.status == BlobStatus::Success => blob,
                // Rows still `none` or `pending` have not been committed and
                // cannot be linked; promotion belongs to the upload path.
                Lookup::Found(_) | Lookup::NotFound => {
                    return Err(FinalizeError::BlobUnknown(digest.to_string()));
                }
            };
            associate(tx.as_mut(), &blob, &project).await?;
            Ok::<_, FinalizeError>(blob)
        }
        .await;

        let blob = finish(tx, outcome).await?;
        info!(%digest, project = %project.name, "blob mount finalized");
        Ok(Some(blob))
    }

    async fn project(&self, name: &str) -> FinalizeResult<Project> {
        match self.registry.project_by_name(name).await {
            Ok(Lookup::Found(project)) => Ok(project),
            Ok(Lookup::NotFound) => Err(FinalizeError::ProjectNotFound(name.to_string())),
            Err(err) => {
                error!(project = %name, error = %err, "get project failed");
                Err(FinalizeError::LookupFailed(err))
            }
        }
    }
}

/// Commit on success, roll back on failure.
async fn finish(
    tx: Box<dyn RegistryTx>,
    outcome: FinalizeResult<Blob>,
) -> FinalizeResult<Blob> {
    match outcome {
        Ok(blob) => {
            tx.commit().await.map_err(FinalizeError::Transaction)?;
            Ok(blob)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback after failed finalization also failed");
            }
            error!(error = %err, "blob finalization aborted");
            Err(err)
        }
    }
}

/// Get-or-create the blob row for `digest` with status `success`.
///
/// The insert goes first; a uniqueness conflict means another writer created
/// the row, which is then re-read and used as-is.
pub async fn ensure(
    tx: &mut dyn RegistryTx,
    digest: &str,
    media_type: &str,
    size: i64,
) -> FinalizeResult<Blob> {
    let failed = |source: RegistryError| FinalizeError::EnsureFailed {
        digest: digest.to_string(),
        source,
    };

    let new_blob = NewBlob {
        digest: digest.to_string(),
        content_type: media_type.to_string(),
        size,
        status: BlobStatus::Success,
    };
    if let Insert::Inserted(blob) = tx.insert_blob(&new_blob).await.map_err(failed)? {
        debug!(%digest, id = blob.id, "created blob row");
        return Ok(blob);
    }

    let existing = match tx.blob(digest).await.map_err(failed)? {
        Lookup::Found(blob) => blob,
        Lookup::NotFound => return Err(failed(RegistryError::Vanished(digest.to_string()))),
    };
    match existing.status {
        BlobStatus::Success => Ok(existing),
        BlobStatus::Deleting => Err(FinalizeError::ConflictingState {
            digest: digest.to_string(),
        }),
        BlobStatus::None | BlobStatus::Pending => {
            tx.mark_blob_success(existing.id).await.map_err(failed)?;
            Ok(Blob {
                status: BlobStatus::Success,
                ..existing
            })
        }
    }
}

/// Link `blob` to `project`; an existing link is accepted silently.
pub async fn associate(
    tx: &mut dyn RegistryTx,
    blob: &Blob,
    project: &Project,
) -> FinalizeResult<()> {
    match tx.associate(project.id, blob.id).await {
        Ok(Insert::Inserted(_)) => Ok(()),
        Ok(Insert::Conflict) => {
            debug!(digest = %blob.digest, project = %project.name, "blob already associated");
            Ok(())
        }
        Err(source) => Err(FinalizeError::AssociateFailed {
            digest: blob.digest.clone(),
            project: project.name.clone(),
            source,
        }),
    }
}
