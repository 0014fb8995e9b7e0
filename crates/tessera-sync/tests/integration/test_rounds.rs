//! Synchronization rounds across devices

use tessera_core::domain::{BlobId, ProviderId, ProviderStatus, TrackedFile, TransferDirection};
use tessera_provider::memory::{Failure, Operation};

use crate::common::{node, store};

#[tokio::test]
async fn test_new_file_reaches_every_replica() {
    let p1 = store("p1");
    let p2 = store("p2");

    let a = node("dev-a", &[p1.clone(), p2.clone()]).await;
    a.write("docs/readme.md", b"hello mesh").await;
    let report = a.sync().await;
    assert_eq!(report.files_checked, 1);
    assert_eq!(report.uploaded, 2);
    assert!(report.errors.is_empty());
    a.quiesce().await;

    // config + one index page + one content blob, lease released
    assert_eq!(p1.len(), 3);
    assert!(!p1.contains(&BlobId::lease()));

    let b = node("dev-b", &[p1.clone(), p2.clone()]).await;
    let report = b.sync().await;
    assert_eq!(report.applied_local, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(b.read("docs/readme.md").await.unwrap(), b"hello mesh");

    // Nothing left to do on either side
    b.quiesce().await;
    let report = a.sync().await;
    assert_eq!(report.applied_local + report.uploaded + report.remote_deleted, 0);
}

#[tokio::test]
async fn test_provider_added_later_is_backfilled() {
    let p1 = store("p1");
    let p2 = store("p2");

    let a = node("dev-a", &[p1.clone()]).await;
    a.write("a.txt", b"one").await;
    a.write("b.txt", b"two").await;
    a.sync().await;
    a.quiesce().await;

    // A second device that also sees an empty provider copies everything over
    let b = node("dev-b", &[p1.clone(), p2.clone()]).await;
    let report = b.sync().await;
    assert_eq!(report.applied_local, 2);
    assert_eq!(report.uploaded, 2);
    b.quiesce().await;

    let c = node("dev-c", &[p2.clone()]).await;
    let report = c.sync().await;
    assert_eq!(report.applied_local, 2);
    assert_eq!(c.read("b.txt").await.unwrap(), b"two");
}

#[tokio::test]
async fn test_deletion_propagates_as_tombstone() {
    let p1 = store("p1");

    let a = node("dev-a", &[p1.clone()]).await;
    a.write("a.txt", b"one").await;
    a.sync().await;
    a.quiesce().await;

    let b = node("dev-b", &[p1.clone()]).await;
    b.sync().await;
    b.quiesce().await;
    assert!(b.read("a.txt").await.is_some());

    a.delete("a.txt").await;
    let report = a.sync().await;
    assert_eq!(report.remote_deleted, 1);
    a.quiesce().await;

    // The replaced content blob is gone: config + index page only
    assert_eq!(p1.len(), 2);

    let report = b.sync().await;
    assert_eq!(report.applied_local, 1);
    assert!(b.read("a.txt").await.is_none());

    let tombstone = b.local.snapshot().await;
    assert_eq!(tombstone.len(), 1);
    assert!(tombstone[0].meta().is_deleted());
}

#[tokio::test]
async fn test_conflicting_versions_are_skipped() {
    let p1 = store("p1");

    let a = node("dev-a", &[p1.clone()]).await;
    a.write("a.txt", b"base").await;
    a.write("b.txt", b"base").await;
    a.sync().await;
    a.quiesce().await;

    let b = node("dev-b", &[p1.clone()]).await;
    b.sync().await;
    b.quiesce().await;

    // Both devices edit a.txt without seeing each other's change
    a.write("a.txt", b"edited on a").await;
    b.write("a.txt", b"edited on b").await;
    b.write("b.txt", b"only b touched this").await;

    let report = a.sync().await;
    assert_eq!(report.uploaded, 1);
    a.quiesce().await;

    let mut files = b.events.subscribe_files();
    let report = b.sync().await;
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.uploaded, 1, "non-conflicting file still proceeds");
    assert_eq!(report.applied_local, 0);
    assert_eq!(b.read("a.txt").await.unwrap(), b"edited on b");

    let conflicted = b
        .local
        .snapshot()
        .await
        .into_iter()
        .find(|r| r.meta().relative_path() == "a.txt")
        .unwrap();
    assert_eq!(report.conflicts[0], *conflicted.meta().id());

    let mut saw_conflict = false;
    while let Ok(event) = files.try_recv() {
        if event.kind == tessera_core::domain::FileEventType::Conflicted {
            assert_eq!(event.path, "a.txt");
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);
}

#[tokio::test]
async fn test_concurrent_synchronize_shares_one_round() {
    let p1 = store("p1");
    let a = node("dev-a", &[p1.clone()]).await;
    a.write("a.txt", b"one").await;
    a.local.scan().await.unwrap();

    let (first, second) = tokio::join!(a.orchestrator.synchronize(), a.orchestrator.synchronize());
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(a.orchestrator.rounds_started(), 1);

    a.orchestrator.synchronize().await.unwrap();
    assert_eq!(a.orchestrator.rounds_started(), 2);
}

#[tokio::test]
async fn test_file_level_failure_is_retried_next_round() {
    let p1 = store("p1");
    let p2 = store("p2");
    let a = node("dev-a", &[p1.clone(), p2.clone()]).await;

    p2.inject_failure(Operation::Post, Failure::Other);
    a.write("a.txt", b"one").await;
    let report = a.sync().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(
        a.lifecycle.slot(&ProviderId::new("p2").unwrap()).unwrap().status(),
        ProviderStatus::Active
    );
    a.quiesce().await;

    p2.clear_failures();
    let report = a.sync().await;
    assert_eq!(report.uploaded, 1);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn test_provider_level_failure_drops_provider() {
    let p1 = store("p1");
    let p2 = store("p2");
    let a = node("dev-a", &[p1.clone(), p2.clone()]).await;

    p2.inject_failure(Operation::Post, Failure::Unavailable);
    a.write("a.txt", b"one").await;
    let report = a.sync().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.errors.len(), 1);

    let slot = a.lifecycle.slot(&ProviderId::new("p2").unwrap()).unwrap();
    assert_eq!(slot.status(), ProviderStatus::Error);
    assert_eq!(a.lifecycle.enabled().len(), 1);
}

#[tokio::test]
async fn test_upload_reports_progress() {
    let p1 = store("p1");
    let a = node("dev-a", &[p1.clone()]).await;
    let mut progress = a.events.subscribe_progress();

    let content = vec![7u8; 200 * 1024];
    a.write("big.bin", &content).await;
    a.sync().await;

    let mut last = None;
    while let Ok(event) = progress.try_recv() {
        assert_eq!(event.direction, TransferDirection::Upload);
        assert!(event.bytes_done <= event.bytes_total);
        last = Some(event);
    }
    let last = last.expect("progress events");
    assert_eq!(last.bytes_done, last.bytes_total);
    assert_eq!(last.bytes_total, content.len() as u64);
}

#[tokio::test]
async fn test_shutdown_releases_leases() {
    let p1 = store("p1");
    let a = node("dev-a", &[p1.clone()]).await;
    a.write("a.txt", b"one").await;
    a.sync().await;

    a.lifecycle.shutdown().await;
    assert!(!p1.contains(&BlobId::lease()));

    // The staged insert was flushed by the final epilogue
    let b = node("dev-b", &[p1.clone()]).await;
    assert_eq!(b.sync().await.applied_local, 1);
}

#[tokio::test]
async fn test_corrupt_replica_falls_back_to_intact_copy() {
    let p1 = store("p1");
    let p2 = store("p2");

    let a = node("dev-a", &[p1.clone(), p2.clone()]).await;
    a.write("a.txt", b"hello").await;
    a.sync().await;
    a.quiesce().await;

    // Damage the content blob on p1 only
    let slot = a.lifecycle.slot(&ProviderId::new("p1").unwrap()).unwrap();
    let record = slot.index_files().await.remove(0);
    p1.insert_raw(record.blob().unwrap().clone(), vec![0u8; 64]);

    let b = node("dev-b", &[p1.clone(), p2.clone()]).await;
    let report = b.sync().await;
    assert_eq!(report.applied_local, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(b.read("a.txt").await.unwrap(), b"hello");
    b.quiesce().await;

    // p1's record was flagged, so the next round rewrites it from the local copy
    let report = b.sync().await;
    assert_eq!(report.uploaded, 1);
    assert!(report.errors.is_empty());
    b.quiesce().await;

    let c = node("dev-c", &[p1.clone()]).await;
    let report = c.sync().await;
    assert_eq!(report.applied_local, 1);
    assert!(report.errors.is_empty());
    assert_eq!(c.read("a.txt").await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_failed_update_is_flagged_then_rewritten() {
    let p1 = store("p1");
    let p2 = store("p2");
    let p2_id = ProviderId::new("p2").unwrap();

    let a = node("dev-a", &[p1.clone(), p2.clone()]).await;
    a.write("a.txt", b"v1").await;
    a.sync().await;
    a.quiesce().await;

    a.write("a.txt", b"version two").await;
    p2.inject_failure(Operation::Post, Failure::Other);
    let report = a.sync().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.errors.len(), 1);
    a.quiesce().await;

    let slot = a.lifecycle.slot(&p2_id).unwrap();
    let flagged = slot.index_files().await.remove(0);
    assert!(flagged.has_error());

    p2.clear_failures();
    let report = a.sync().await;
    assert_eq!(report.uploaded, 1);
    assert!(report.errors.is_empty());
    a.quiesce().await;

    let local = a.local.get(flagged.id()).await.unwrap();
    let rewritten = slot.index_files().await.remove(0);
    assert!(!rewritten.has_error());
    assert_eq!(rewritten.meta().clock(), local.meta().clock());
    assert_eq!(
        rewritten.meta().compare(flagged.meta()),
        tessera_core::domain::ClockOrdering::Newer
    );

    let b = node("dev-b", &[p2.clone()]).await;
    b.sync().await;
    assert_eq!(b.read("a.txt").await.unwrap(), b"version two");
}
