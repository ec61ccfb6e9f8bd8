mod common;

use common::{Harness, read_all};
use files_store::{
    errors::FilesError,
    services::{
        files::{CheckOutcome, FileCheck},
        jobs::{ChecksumVerifier, MigrateOptions, Migrator, OrphanCleaner, VerificationBatch},
    },
    storage::{ChecksumAlgorithm, bytes_stream},
};
use std::sync::Arc;

#[tokio::test]
async fn every_key_keeps_exactly_one_head() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;

    assert_eq!(h.head_count(&bucket, "never.txt").await, 0);

    h.put(&bucket, "a.txt", b"one").await;
    h.put(&bucket, "a.txt", b"two").await;
    h.store.objects.delete_object(bucket.id, "a.txt").await.unwrap();
    h.put(&bucket, "a.txt", b"three").await;
    h.store.objects.delete_object(bucket.id, "a.txt").await.unwrap();

    assert_eq!(h.head_count(&bucket, "a.txt").await, 1);
    let versions = h
        .store
        .objects
        .list_versions(bucket.id, Some("a.txt"))
        .await
        .unwrap();
    assert_eq!(versions.len(), 5);
    assert!(versions[0].is_head && versions[0].is_delete_marker());
}

#[tokio::test]
async fn put_then_get_returns_identical_bytes_and_checksum() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    let data: &'static [u8] = b"the quick brown fox jumps over the lazy dog";

    h.put(&bucket, "a.txt", data).await;
    assert_eq!(h.read(&bucket, "a.txt", None).await, data);

    let head = h.store.objects.get_object(bucket.id, "a.txt", None).await.unwrap();
    let file = h.store.files.get(head.file_id.unwrap()).await.unwrap();
    assert_eq!(
        file.checksum.as_deref(),
        Some(ChecksumAlgorithm::Sha256.digest(data).as_str())
    );
    assert_eq!(file.size, data.len() as i64);
}

#[tokio::test]
async fn shared_file_survives_removal_of_one_version() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    let first = h.put(&bucket, "a.txt", b"same bytes").await;
    let file_id = h
        .store
        .objects
        .get_object(bucket.id, "a.txt", None)
        .await
        .unwrap()
        .file_id
        .unwrap();

    // Second key reuses the identical content.
    let found = h
        .store
        .files
        .find_by_checksum(&ChecksumAlgorithm::Sha256.digest(b"same bytes"), 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, file_id);
    h.store.objects.put_file(bucket.id, "b.txt", found.id).await.unwrap();

    h.store
        .objects
        .remove_version(bucket.id, "a.txt", first)
        .await
        .unwrap();
    let cleaner = OrphanCleaner::new(h.store.db.clone(), h.store.files.clone());
    let report = cleaner.run(100).await.unwrap();
    assert_eq!(report.removed, 0);

    assert!(!h.store.files.remove_file_data(file_id).await.unwrap());
    assert_eq!(h.read(&bucket, "b.txt", None).await, b"same bytes");
}

#[tokio::test]
async fn delete_hides_head_but_keeps_prior_versions() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    let previous = h.put(&bucket, "a.txt", b"before delete").await;
    h.store.objects.delete_object(bucket.id, "a.txt").await.unwrap();

    let err = h
        .store
        .objects
        .get_object(bucket.id, "a.txt", None)
        .await
        .unwrap_err();
    assert!(matches!(err, FilesError::NotFound { .. }));
    assert_eq!(
        h.read(&bucket, "a.txt", Some(previous)).await,
        b"before delete"
    );
}

#[tokio::test]
async fn corrupted_bytes_are_flagged_without_rewriting_the_checksum() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    h.put(&bucket, "a.txt", b"pristine").await;
    let head = h.store.objects.get_object(bucket.id, "a.txt", None).await.unwrap();
    let before = h.store.files.get(head.file_id.unwrap()).await.unwrap();

    std::fs::write(&before.uri, b"tampered").unwrap();

    let mut events = h.store.events.subscribe();
    let verifier = ChecksumVerifier::new(h.store.db.clone(), h.store.files.clone());
    let report = verifier
        .run_batch(VerificationBatch {
            max_count: None,
            max_size: None,
            ..VerificationBatch::default()
        })
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let after = h.store.files.get(before.id).await.unwrap();
    assert!(!after.readable);
    assert_eq!(after.last_check, Some(false));
    assert_eq!(after.checksum, before.checksum);
    assert!(events.try_recv().is_ok());

    let err = h
        .store
        .objects
        .get_object(bucket.id, "a.txt", None)
        .await
        .unwrap_err();
    assert!(matches!(err, FilesError::FileUnreadable(id) if id == before.id));
    let err = h.store.objects.open_object(head, None).await.err().unwrap();
    assert!(matches!(err, FilesError::FileUnreadable(_)));
}

#[tokio::test]
async fn multipart_parts_merge_into_one_file() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    let mp = &h.store.multipart;

    let upload = mp.initiate(bucket.id, "big.bin", 10, 5).await.unwrap();
    mp.upload_part(upload.upload_id, 0, bytes_stream(&b"hello"[..]))
        .await
        .unwrap();
    mp.upload_part(upload.upload_id, 1, bytes_stream(&b"world"[..]))
        .await
        .unwrap();
    let version = mp.complete(upload.upload_id).await.unwrap();

    let file = h.store.files.get(version.file_id.unwrap()).await.unwrap();
    assert_eq!(file.size, 10);
    assert_eq!(
        file.checksum.as_deref(),
        Some(ChecksumAlgorithm::Sha256.digest(b"helloworld").as_str())
    );
    assert_eq!(h.read(&bucket, "big.bin", None).await, b"helloworld");
}

#[tokio::test]
async fn multipart_missing_part_fails_validation() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    let mp = &h.store.multipart;

    let upload = mp.initiate(bucket.id, "big.bin", 10, 5).await.unwrap();
    mp.upload_part(upload.upload_id, 0, bytes_stream(&b"hello"[..]))
        .await
        .unwrap();
    let err = mp.complete(upload.upload_id).await.unwrap_err();
    assert!(matches!(err, FilesError::MultipartValidation(_)));

    // Staging is intact; the missing part can still arrive.
    mp.upload_part(upload.upload_id, 1, bytes_stream(&b"world"[..]))
        .await
        .unwrap();
    mp.complete(upload.upload_id).await.unwrap();
}

#[tokio::test]
async fn orphan_cleanup_spares_non_head_versions() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    let old = h.put(&bucket, "a.txt", b"old contents").await;
    h.put(&bucket, "a.txt", b"new contents").await;

    // An unreferenced file is the only thing cleanup may take.
    let stray = h
        .store
        .files
        .create(&h.location, "fs", bytes_stream(&b"stray"[..]), None)
        .await
        .unwrap();

    let cleaner = OrphanCleaner::new(h.store.db.clone(), h.store.files.clone());
    let report = cleaner.run(100).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(h.store.files.get(stray.id).await.is_err());
    assert_eq!(h.read(&bucket, "a.txt", Some(old)).await, b"old contents");
}

#[tokio::test]
async fn orphan_veto_keeps_files() {
    let h = Harness::new().await;
    let held = h
        .store
        .files
        .create(&h.location, "fs", bytes_stream(&b"legal hold"[..]), None)
        .await
        .unwrap();
    let held_id = held.id;
    let cleaner = OrphanCleaner::new(h.store.db.clone(), h.store.files.clone())
        .with_veto(Arc::new(move |file| file.id == held_id));

    let report = cleaner.run(100).await.unwrap();
    assert_eq!(report.vetoed, 1);
    assert_eq!(report.removed, 0);
    assert!(h.store.files.get(held_id).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_never_leave_two_heads() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    h.put(&bucket, "race.txt", b"seed").await;

    let objects = &h.store.objects;
    let a = objects
        .stage_object(bucket.id, bytes_stream(&b"writer a"[..]), None)
        .await
        .unwrap();
    let b = objects
        .stage_object(bucket.id, bytes_stream(&b"writer b"[..]), None)
        .await
        .unwrap();

    let (ra, rb) = tokio::join!(
        objects.commit_staged(bucket.id, "race.txt", &a),
        objects.commit_staged(bucket.id, "race.txt", &b),
    );

    let mut successes = Vec::new();
    for result in [ra, rb] {
        match result {
            Ok(version) => successes.push(version.version_id),
            Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
        }
    }
    assert!(!successes.is_empty());
    assert_eq!(h.head_count(&bucket, "race.txt").await, 1);

    let head = objects.get_object(bucket.id, "race.txt", None).await.unwrap();
    assert!(successes.contains(&head.version_id));
}

#[tokio::test]
async fn migration_relinks_every_version() {
    let h = Harness::new().await;
    let bucket = h.bucket().await;
    let first = h.put(&bucket, "a.txt", b"moving bytes").await;
    let file_id = h
        .store
        .objects
        .get_object(bucket.id, "a.txt", None)
        .await
        .unwrap()
        .file_id
        .unwrap();
    h.store.objects.put_file(bucket.id, "b.txt", file_id).await.unwrap();

    let archive = h.dir.path().join("archive");
    h.store
        .objects
        .create_location("archive", &archive.to_string_lossy(), false)
        .await
        .unwrap();

    let migrator = Migrator::new(
        h.store.db.clone(),
        h.store.files.clone(),
        h.store.objects.clone(),
    );
    let moved = migrator
        .migrate_file(
            file_id,
            "archive",
            &MigrateOptions {
                post_fixity_check: true,
                remove_source: true,
                backend: None,
            },
        )
        .await
        .unwrap();

    assert!(moved.uri.starts_with(&*archive.to_string_lossy()));
    assert_eq!(moved.last_check, Some(true));
    assert!(h.store.files.get(file_id).await.is_err());
    for (key, version) in [("a.txt", Some(first)), ("b.txt", None)] {
        let v = h
            .store
            .objects
            .get_object(bucket.id, key, version)
            .await
            .unwrap();
        assert_eq!(v.file_id, Some(moved.id));
        let opened = h.store.objects.open_object(v, None).await.unwrap();
        assert_eq!(read_all(opened.reader).await, b"moving bytes");
    }
}

#[tokio::test]
async fn verification_reports_missing_bytes_as_unknown() {
    let h = Harness::new().await;
    let file = h
        .store
        .files
        .create(&h.location, "fs", bytes_stream(&b"gone soon"[..]), None)
        .await
        .unwrap();
    std::fs::remove_file(&file.uri).unwrap();

    let check: FileCheck = h
        .store
        .files
        .verify_checksum(
            file.id,
            files_store::services::files::VerifyOptions {
                throws: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(check.outcome, CheckOutcome::Unavailable);
    let after = h.store.files.get(file.id).await.unwrap();
    assert_eq!(after.last_check, None);
    assert!(after.readable);
}
