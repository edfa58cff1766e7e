//! Distribution API path grammar and header names.
//!
//! Only the subset the blob upload flow needs is recognised:
//!
//! - `GET  /v2/`
//! - `POST /v2/{name}/blobs/uploads/` (optionally `?mount={digest}&from={repo}`)
//! - `PATCH /v2/{name}/blobs/uploads/{session}`
//! - `PUT  /v2/{name}/blobs/uploads/{session}?digest={digest}`
//! - `HEAD /v2/{name}/blobs/{digest}` and `GET` of the same
//!
//! `{name}` may contain slashes (`project/team/app`); its first component is the project.

use axum::{
    extract::Query,
    http::{Method, Uri},
};
use serde::Deserialize;

pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
pub const DOCKER_UPLOAD_UUID: &str = "docker-upload-uuid";

const SHA256_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryRoute {
    Base,
    InitiateUpload {
        repository: String,
    },
    PatchUpload {
        repository: String,
        session_id: String,
    },
    CompleteUpload {
        repository: String,
        session_id: String,
    },
    HeadBlob {
        repository: String,
        digest: String,
    },
    GetBlob {
        repository: String,
        digest: String,
    },
}

impl RegistryRoute {
    pub fn parse(method: &Method, path: &str) -> Option<Self> {
        let rest = path.strip_prefix("/v2/")?;
        if rest.is_empty() {
            return (*method == Method::GET || *method == Method::HEAD).then_some(Self::Base);
        }

        let split = rest.rfind("/blobs/")?;
        let repository = &rest[..split];
        if !is_valid_repository(repository) {
            return None;
        }
        let repository = repository.to_string();
        let tail = &rest[split + "/blobs/".len()..];

        if tail == "uploads" || tail == "uploads/" {
            return (*method == Method::POST).then_some(Self::InitiateUpload { repository });
        }

        if let Some(session_id) = tail.strip_prefix("uploads/") {
            if session_id.is_empty() || session_id.contains('/') {
                return None;
            }
            let session_id = session_id.to_string();
            return match *method {
                Method::PATCH => Some(Self::PatchUpload {
                    repository,
                    session_id,
                }),
                Method::PUT => Some(Self::CompleteUpload {
                    repository,
                    session_id,
                }),
                _ => None,
            };
        }

        if tail.is_empty() || tail.contains('/') {
            return None;
        }
        let digest = tail.to_string();
        match *method {
            Method::HEAD => Some(Self::HeadBlob { repository, digest }),
            Method::GET => Some(Self::GetBlob { repository, digest }),
            _ => None,
        }
    }

    pub fn repository(&self) -> Option<&str> {
        match self {
            Self::Base => None,
            Self::InitiateUpload { repository }
            | Self::PatchUpload { repository, .. }
            | Self::CompleteUpload { repository, .. }
            | Self::HeadBlob { repository, .. }
            | Self::GetBlob { repository, .. } => Some(repository),
        }
    }
}

/// Project that owns `repository`: its first path component.
pub fn parse_project_name(repository: &str) -> &str {
    repository.split('/').next().unwrap_or(repository)
}

/// Lowercase path components of `[a-z0-9._-]`, each starting with a letter or digit.
pub fn is_valid_repository(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|component| {
            component
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && component
                    .chars()
                    .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-'))
        })
}

/// Hex part of a `sha256:<64 hex>` digest, or `None` if malformed.
pub fn sha256_hex(digest: &str) -> Option<&str> {
    let hex = digest.strip_prefix(SHA256_PREFIX)?;
    (hex.len() == 64 && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))).then_some(hex)
}

pub fn sha256_digest(hex: &str) -> String {
    format!("{SHA256_PREFIX}{hex}")
}

/// Query parameters the upload endpoints accept.
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub digest: Option<String>,
    pub mount: Option<String>,
    pub from: Option<String>,
}

impl UploadQuery {
    /// Parse the query string of `uri`; malformed queries yield no parameters.
    pub fn from_uri(uri: &Uri) -> Self {
        Query::<Self>::try_from_uri(uri)
            .map(|Query(query)| query)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

    #[test]
    fn parses_upload_routes_with_nested_repository() {
        assert_eq!(
            RegistryRoute::parse(&Method::POST, "/v2/library/team/app/blobs/uploads/"),
            Some(RegistryRoute::InitiateUpload {
                repository: "library/team/app".into()
            })
        );
        assert_eq!(
            RegistryRoute::parse(&Method::PUT, "/v2/library/app/blobs/uploads/abc-123"),
            Some(RegistryRoute::CompleteUpload {
                repository: "library/app".into(),
                session_id: "abc-123".into()
            })
        );
        assert_eq!(
            RegistryRoute::parse(&Method::PATCH, "/v2/library/app/blobs/uploads/abc-123"),
            Some(RegistryRoute::PatchUpload {
                repository: "library/app".into(),
                session_id: "abc-123".into()
            })
        );
    }

    #[test]
    fn parses_blob_routes() {
        let path = format!("/v2/proj/app/blobs/{DIGEST}");
        assert_eq!(
            RegistryRoute::parse(&Method::HEAD, &path),
            Some(RegistryRoute::HeadBlob {
                repository: "proj/app".into(),
                digest: DIGEST.into()
            })
        );
        assert!(matches!(
            RegistryRoute::parse(&Method::GET, &path),
            Some(RegistryRoute::GetBlob { .. })
        ));
        assert_eq!(RegistryRoute::parse(&Method::DELETE, &path), None);
    }

    #[test]
    fn rejects_unknown_paths() {
        assert_eq!(RegistryRoute::parse(&Method::GET, "/v2/"), Some(RegistryRoute::Base));
        assert_eq!(RegistryRoute::parse(&Method::GET, "/v1/a/blobs/x"), None);
        assert_eq!(RegistryRoute::parse(&Method::POST, "/v2/Upper/blobs/uploads/"), None);
        assert_eq!(RegistryRoute::parse(&Method::PUT, "/v2/a/b/blobs/uploads/x/y"), None);
        assert_eq!(RegistryRoute::parse(&Method::GET, "/v2/a/b/manifests/latest"), None);
    }

    #[test]
    fn project_is_first_component() {
        assert_eq!(parse_project_name("library/team/app"), "library");
        assert_eq!(parse_project_name("single"), "single");
    }

    #[test]
    fn validates_sha256_digests() {
        assert!(sha256_hex(DIGEST).is_some());
        assert!(sha256_hex("sha256:abc").is_none());
        assert!(sha256_hex("sha512:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae").is_none());
        assert!(sha256_hex(&DIGEST.to_uppercase()).is_none());
    }

    #[test]
    fn upload_query_reads_mount_and_digest() {
        let uri: Uri = "/v2/p/a/blobs/uploads/?mount=sha256:aa&from=q/b".parse().unwrap();
        let query = UploadQuery::from_uri(&uri);
        assert_eq!(query.mount.as_deref(), Some("sha256:aa"));
        assert_eq!(query.from.as_deref(), Some("q/b"));
        assert_eq!(query.digest, None);

        let bare: Uri = "/v2/p/a/blobs/uploads/".parse().unwrap();
        assert!(UploadQuery::from_uri(&bare).mount.is_none());
    }
}
