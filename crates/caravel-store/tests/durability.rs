//! Durable persistence: restart recovery, corruption handling, retry bounds

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use caravel_bundle::{Bundle, BundleId, EndpointId};
use caravel_store::{
    BundleStore, DeletionReason, LifecycleState, StoreConfig, StoreError, StoreEvent,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn endpoint(name: &str) -> EndpointId {
    EndpointId::node(name).unwrap()
}

fn bundle(seq: u64, payload: &[u8]) -> Bundle {
    Bundle::new(
        endpoint("alpha"),
        endpoint("beta"),
        1_000,
        seq,
        Bytes::copy_from_slice(payload),
    )
    .with_lifetime(3_600)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

fn artifact_paths(dir: &std::path::Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "bundle"))
        .collect()
}

#[tokio::test]
async fn test_reopen_restores_stored_bundles() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let store = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    let bundles: Vec<Bundle> = (1..=3).map(|seq| bundle(seq, b"durable")).collect();
    for b in &bundles {
        tokio_test::assert_ok!(store.store(b.clone()).await);
    }
    store.shutdown().await.unwrap();

    let reopened = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    assert_eq!(reopened.count(), 3);
    for b in &bundles {
        let back = reopened.get(&b.id()).await.unwrap();
        assert_eq!(&back, b);
        assert_eq!(
            reopened.lifecycle_of(&b.id()),
            Some(LifecycleState::Durable)
        );
    }
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_artifact_is_deleted_on_restore() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let store = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    store.store(bundle(1, b"payload")).await.unwrap();
    store.shutdown().await.unwrap();

    let paths = artifact_paths(dir.path());
    assert_eq!(paths.len(), 1);
    std::fs::write(&paths[0], b"\xff\xff not a bundle").unwrap();

    let reopened = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    assert_eq!(reopened.count(), 0);
    assert!(artifact_paths(dir.path()).is_empty());
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_temp_leftovers_are_swept_on_open() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let leftover = dir.path().join("interrupted.tmp");
    std::fs::write(&leftover, b"half a write").unwrap();

    let store = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    assert!(!leftover.exists());
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_artifact_is_purged_on_get() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = BundleStore::open(StoreConfig::new(dir.path()), Some(tx))
        .await
        .unwrap();

    let b = bundle(1, b"payload");
    let id = b.id();
    store.store(b).await.unwrap();
    wait_until(|| store.lifecycle_of(&id) == Some(LifecycleState::Durable)).await;

    for path in artifact_paths(dir.path()) {
        std::fs::remove_file(path).unwrap();
    }

    let err = store.get(&id).await.unwrap_err();
    assert!(matches!(err, StoreError::LoadFailed { .. }));
    // Purged: the identity is gone and the deletion was announced.
    assert!(matches!(store.get(&id).await, Err(StoreError::NotFound)));
    assert_eq!(store.count(), 0);

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        StoreEvent::BundleDeleted {
            id,
            reason: DeletionReason::Unrecoverable,
        }
    );
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_retries_until_success() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    // Nine failures against a cap of ten: the tenth attempt lands.
    let config = StoreConfig::new(dir.path()).with_injected_write_failures(9);
    let store = BundleStore::open(config, None).await.unwrap();

    let b = bundle(1, b"eventually durable");
    let id = b.id();
    store.store(b).await.unwrap();

    wait_until(|| store.lifecycle_of(&id) == Some(LifecycleState::Durable)).await;
    assert_eq!(artifact_paths(dir.path()).len(), 1);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_abandoned_at_retry_cap() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new(dir.path())
        .with_max_write_attempts(3)
        .with_injected_write_failures(u32::MAX);
    let store = BundleStore::open(config, None).await.unwrap();

    let b = bundle(1, b"memory only");
    let id = b.id();
    store.store(b.clone()).await.unwrap();

    wait_until(|| store.lifecycle_of(&id) == Some(LifecycleState::Resident)).await;
    assert!(artifact_paths(dir.path()).is_empty());

    // Still served from memory within this process lifetime.
    let back = store.get(&id).await.unwrap();
    assert_eq!(back, b);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_fragment_group_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..150u8).collect();

    let fragment = |offset: u64, range: std::ops::Range<usize>| {
        Bundle::new(
            endpoint("alpha"),
            endpoint("beta"),
            1_000,
            5,
            Bytes::copy_from_slice(&payload[range]),
        )
        .as_fragment(offset, 150)
    };

    let store = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    store.store(fragment(0, 0..50)).await.unwrap();
    store.store(fragment(50, 50..100)).await.unwrap();
    assert_eq!(store.pending_fragment_groups(), 1);
    store.shutdown().await.unwrap();

    let reopened = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    assert_eq!(reopened.pending_fragment_groups(), 1);
    assert_eq!(reopened.count(), 0);

    // The missing tail completes the group after the restart.
    reopened.store(fragment(100, 100..150)).await.unwrap();
    let whole = reopened
        .get(&BundleId::new(endpoint("alpha"), 1_000, 5))
        .await
        .unwrap();
    assert_eq!(&whole.payload().unwrap().data[..], &payload[..]);
    assert_eq!(reopened.pending_fragment_groups(), 0);
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_over_quota_artifact_is_dropped_honestly_on_restore() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let store = BundleStore::open(StoreConfig::new(dir.path()), None)
        .await
        .unwrap();
    store.store(bundle(1, &[1u8; 1_024])).await.unwrap();
    store.store(bundle(2, &[2u8; 1_024])).await.unwrap();
    store.shutdown().await.unwrap();
    assert_eq!(artifact_paths(dir.path()).len(), 2);

    // A tighter quota on reopen admits only one of the two artifacts; the
    // other is dropped as a storage decision, with a deletion event.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reopened = BundleStore::open(
        StoreConfig::new(dir.path()).with_quota(1_200),
        Some(tx),
    )
    .await
    .unwrap();
    assert_eq!(reopened.count(), 1);
    assert_eq!(artifact_paths(dir.path()).len(), 1);

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        StoreEvent::BundleDeleted {
            reason: DeletionReason::DepletedStorage,
            ..
        }
    ));
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quota_applies_across_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let store = BundleStore::open(StoreConfig::new(dir.path()).with_quota(4_096), None)
        .await
        .unwrap();
    store.store(bundle(1, &[7u8; 2_048])).await.unwrap();
    store.shutdown().await.unwrap();

    let reopened = BundleStore::open(StoreConfig::new(dir.path()).with_quota(4_096), None)
        .await
        .unwrap();
    assert_eq!(reopened.count(), 1);

    // The restored bundle still counts against the quota.
    let err = reopened.store(bundle(2, &[7u8; 2_048])).await.unwrap_err();
    assert!(matches!(err, StoreError::SizeExceeded { .. }));
    reopened.shutdown().await.unwrap();
}
