//! Finalizer behavior against the in-memory registry.

mod common;

use axum::http::StatusCode;
use blob_registry::{
    models::blob::{BlobStatus, DEFAULT_MEDIA_TYPE},
    repos::{BlobRegistry, Insert, Lookup, MemoryRegistry},
    services::finalizer::{CompletedUpload, FinalizeError, ensure},
};
use common::memory_finalizer;
use futures::future::join_all;

const DIGEST: &str = "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

fn upload(project: &str, session_id: &str, content_length: Option<&str>) -> CompletedUpload {
    CompletedUpload {
        project: project.to_string(),
        session_id: session_id.to_string(),
        digest: DIGEST.to_string(),
        content_length: content_length.map(str::to_string),
    }
}

async fn registry_with_projects(names: &[&str]) -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    for name in names {
        let created = registry.create_project(name).await.unwrap();
        assert!(matches!(created, Insert::Inserted(_)));
    }
    registry
}

#[tokio::test]
async fn concurrent_ensure_converges_on_one_blob() {
    let registry = MemoryRegistry::new();

    let handles = (0..16).map(|_| {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut tx = registry.begin().await.unwrap();
            let blob = ensure(tx.as_mut(), DIGEST, DEFAULT_MEDIA_TYPE, 1024)
                .await
                .unwrap();
            tx.commit().await.unwrap();
            blob
        })
    });
    let blobs: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(registry.blob_count(), 1);
    let first = &blobs[0];
    assert!(blobs.iter().all(|blob| blob.id == first.id));
    assert!(blobs.iter().all(|blob| blob.status == BlobStatus::Success));
}

#[tokio::test]
async fn concurrent_uploads_of_same_content_share_the_blob() {
    let projects = ["p0", "p1", "p2", "p3", "p4", "p5"];
    let registry = registry_with_projects(&projects).await;
    let finalizer = memory_finalizer(&registry);

    let handles = projects.iter().map(|project| {
        let finalizer = finalizer.clone();
        let upload = upload(project, "session", Some("1024"));
        tokio::spawn(async move { finalizer.finalize_upload(StatusCode::CREATED, &upload).await })
    });
    for joined in join_all(handles).await {
        assert!(joined.unwrap().unwrap().is_some());
    }

    assert_eq!(registry.blob_count(), 1);
    assert_eq!(registry.association_count(), projects.len());
}

#[tokio::test]
async fn guard_rejects_deleting_blob() {
    let registry = MemoryRegistry::new();
    registry.seed_blob(DIGEST, 10, BlobStatus::Deleting).await;

    let err = memory_finalizer(&registry)
        .check_not_deleting(DIGEST)
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::ConflictingState { ref digest } if digest == DIGEST));
}

#[tokio::test]
async fn guard_passes_unknown_pending_and_success_blobs() {
    let registry = MemoryRegistry::new();
    let finalizer = memory_finalizer(&registry);

    finalizer.check_not_deleting(DIGEST).await.unwrap();
    finalizer.check_not_deleting("").await.unwrap();

    registry.seed_blob(DIGEST, 10, BlobStatus::Pending).await;
    finalizer.check_not_deleting(DIGEST).await.unwrap();

    registry.set_blob_status(DIGEST, BlobStatus::Success).await;
    finalizer.check_not_deleting(DIGEST).await.unwrap();

    assert_eq!(registry.writes(), 0);
}

#[tokio::test]
async fn guard_fails_closed_when_lookup_fails() {
    let registry = MemoryRegistry::new();
    registry.fail_lookups(true);

    let err = memory_finalizer(&registry)
        .check_not_deleting(DIGEST)
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::LookupFailed(_)));
}

#[tokio::test]
async fn failed_association_rolls_back_new_blob() {
    let registry = registry_with_projects(&["alpha"]).await;
    registry.fail_associate(true);

    let err = memory_finalizer(&registry)
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "s1", Some("1024")))
        .await
        .unwrap_err();

    assert!(matches!(err, FinalizeError::AssociateFailed { .. }));
    assert_eq!(registry.blob_count(), 0);
    assert_eq!(registry.association_count(), 0);
    assert!(matches!(registry.blob(DIGEST).await.unwrap(), Lookup::NotFound));
}

#[tokio::test]
async fn failed_association_keeps_preexisting_blob_untouched() {
    let registry = registry_with_projects(&["alpha"]).await;
    let before = registry.seed_blob(DIGEST, 77, BlobStatus::Success).await;
    registry.fail_associate(true);

    memory_finalizer(&registry)
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "s1", Some("1024")))
        .await
        .unwrap_err();

    assert_eq!(registry.blob(DIGEST).await.unwrap(), Lookup::Found(before));
    assert_eq!(registry.association_count(), 0);
}

#[tokio::test]
async fn upload_then_mount_adds_one_association() {
    let registry = registry_with_projects(&["a", "b"]).await;
    let finalizer = memory_finalizer(&registry);

    let uploaded = finalizer
        .finalize_upload(StatusCode::CREATED, &upload("a", "s1", Some("1024")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(uploaded.size, 1024);
    assert_eq!(uploaded.status, BlobStatus::Success);
    assert_eq!(registry.blob_count(), 1);
    assert_eq!(registry.association_count(), 1);

    let mounted = finalizer
        .finalize_mount(StatusCode::CREATED, "b", Some(DIGEST))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mounted, uploaded);
    assert_eq!(registry.blob_count(), 1);
    assert_eq!(registry.association_count(), 2);
    assert_eq!(registry.blob(DIGEST).await.unwrap(), Lookup::Found(uploaded.clone()));

    // Repeating the mount is a no-op.
    finalizer
        .finalize_mount(StatusCode::CREATED, "b", Some(DIGEST))
        .await
        .unwrap();
    assert_eq!(registry.association_count(), 2);
}

#[tokio::test]
async fn mount_of_unknown_or_deleting_blob_fails() {
    let registry = registry_with_projects(&["b"]).await;
    let finalizer = memory_finalizer(&registry);

    let err = finalizer
        .finalize_mount(StatusCode::CREATED, "b", Some(DIGEST))
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::BlobUnknown(_)));

    registry.seed_blob(DIGEST, 5, BlobStatus::Deleting).await;
    let err = finalizer
        .finalize_mount(StatusCode::CREATED, "b", Some(DIGEST))
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::ConflictingState { .. }));
    assert_eq!(registry.association_count(), 0);
}

#[tokio::test]
async fn mount_of_uncommitted_blob_fails_without_promoting_it() {
    for status in [BlobStatus::None, BlobStatus::Pending] {
        let registry = registry_with_projects(&["b"]).await;
        let finalizer = memory_finalizer(&registry);
        registry.seed_blob(DIGEST, 5, status).await;

        let err = finalizer
            .finalize_mount(StatusCode::CREATED, "b", Some(DIGEST))
            .await
            .unwrap_err();
        assert!(matches!(err, FinalizeError::BlobUnknown(_)));
        assert_eq!(registry.association_count(), 0);

        let stored = registry.blob(DIGEST).await.unwrap().found().unwrap();
        assert_eq!(stored.status, status);
    }
}

#[tokio::test]
async fn non_created_status_performs_no_writes() {
    let registry = registry_with_projects(&["alpha"]).await;
    let finalizer = memory_finalizer(&registry);

    for status in [
        StatusCode::OK,
        StatusCode::ACCEPTED,
        StatusCode::BAD_REQUEST,
        StatusCode::INTERNAL_SERVER_ERROR,
    ] {
        let outcome = finalizer
            .finalize_upload(status, &upload("alpha", "s1", None))
            .await
            .unwrap();
        assert!(outcome.is_none());
        let outcome = finalizer
            .finalize_mount(status, "alpha", Some(DIGEST))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    // Created, but not a mount request.
    assert!(
        finalizer
            .finalize_mount(StatusCode::CREATED, "alpha", None)
            .await
            .unwrap()
            .is_none()
    );

    assert_eq!(registry.transactions(), 0);
    assert_eq!(registry.writes(), 0);
    assert_eq!(registry.session_lookups(), 0);
}

#[tokio::test]
async fn size_falls_back_to_session_tracker() {
    let registry = registry_with_projects(&["alpha"]).await;
    registry.set_accepted_size("s1", 4096);
    let finalizer = memory_finalizer(&registry);

    assert_eq!(finalizer.resolve_size(None, "s1").await.unwrap(), 4096);
    assert_eq!(finalizer.resolve_size(Some("0"), "s1").await.unwrap(), 4096);
    assert_eq!(finalizer.resolve_size(Some("garbage"), "s1").await.unwrap(), 4096);
    assert_eq!(registry.session_lookups(), 3);

    let blob = finalizer
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "s1", Some("0")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob.size, 4096);
}

#[tokio::test]
async fn declared_size_skips_session_tracker() {
    let registry = registry_with_projects(&["alpha"]).await;
    registry.fail_sessions(true);
    let finalizer = memory_finalizer(&registry);

    let blob = finalizer
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "s1", Some("1024")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob.size, 1024);
    assert_eq!(registry.session_lookups(), 0);
}

#[tokio::test]
async fn unresolved_size_aborts_before_transaction() {
    let registry = registry_with_projects(&["alpha"]).await;
    let finalizer = memory_finalizer(&registry);

    let err = finalizer
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "missing", None))
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::SizeUnresolved { .. }));

    registry.fail_sessions(true);
    let err = finalizer
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "missing", None))
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::LookupFailed(_)));
    assert_eq!(registry.transactions(), 0);
}

#[tokio::test]
async fn unknown_project_aborts_without_writes() {
    let registry = MemoryRegistry::new();
    let err = memory_finalizer(&registry)
        .finalize_upload(StatusCode::CREATED, &upload("ghost", "s1", Some("3")))
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::ProjectNotFound(ref name) if name == "ghost"));
    assert_eq!(registry.transactions(), 0);
}

#[tokio::test]
async fn missing_response_digest_is_an_error() {
    let registry = registry_with_projects(&["alpha"]).await;
    let mut completed = upload("alpha", "s1", Some("3"));
    completed.digest.clear();

    let err = memory_finalizer(&registry)
        .finalize_upload(StatusCode::CREATED, &completed)
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::DigestMissing));
}

#[tokio::test]
async fn ensure_promotes_pending_row_and_keeps_its_size() {
    let registry = registry_with_projects(&["alpha"]).await;
    let pending = registry.seed_blob(DIGEST, 512, BlobStatus::Pending).await;

    let blob = memory_finalizer(&registry)
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "s1", Some("1024")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(blob.id, pending.id);
    assert_eq!(blob.size, 512);
    let stored = registry.blob(DIGEST).await.unwrap().found().unwrap();
    assert_eq!(stored.status, BlobStatus::Success);
}

#[tokio::test]
async fn ensure_refuses_deleting_row() {
    let registry = registry_with_projects(&["alpha"]).await;
    registry.seed_blob(DIGEST, 512, BlobStatus::Deleting).await;

    let err = memory_finalizer(&registry)
        .finalize_upload(StatusCode::CREATED, &upload("alpha", "s1", Some("1024")))
        .await
        .unwrap_err();
    assert!(matches!(err, FinalizeError::ConflictingState { .. }));
    assert_eq!(registry.association_count(), 0);
}
