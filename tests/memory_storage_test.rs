// Integration tests for the in-memory storage backend
// Covers record round-trips, TTL sweeping, version-change waits, and
// close semantics

use std::time::{Duration, Instant};

use dlock::{MemoryStorage, Payload, Record, Storage, StorageError};

fn json_record(key: &str, value: serde_json::Value) -> Record {
    Record::new(key, Payload::Json(value), Duration::ZERO)
}

#[tokio::test]
async fn test_create_then_get_round_trip() {
    let storage = MemoryStorage::new();

    let created = storage
        .create(json_record("k", serde_json::json!("val")))
        .await
        .unwrap();
    assert_eq!(created.key, "k");
    assert_eq!(created.version, 1);
    assert_eq!(created.ttl, Duration::ZERO);

    let got = storage.get("k").await.unwrap();
    assert_eq!(got.version, 1);
    assert_eq!(got.value, Payload::Json(serde_json::json!("val")));

    assert!(matches!(
        storage.get("missing").await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn test_create_conflict_returns_existing_record() {
    let storage = MemoryStorage::new();
    storage
        .create(json_record("k", serde_json::json!("original")))
        .await
        .unwrap();

    match storage
        .create(json_record("k", serde_json::json!("other")))
        .await
    {
        Err(StorageError::AlreadyExists { current }) => {
            assert_eq!(current.version, 1);
            assert_eq!(current.value, Payload::Json(serde_json::json!("original")));
        }
        other => panic!("expected AlreadyExists, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cas_advances_version_and_rejects_stale() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(json_record("k", serde_json::json!("v1")))
        .await
        .unwrap();

    let mut next = created.clone();
    next.value = Payload::Json(serde_json::json!("v2"));
    let updated = storage.cas_by_version(next).await.unwrap();
    assert_eq!(updated.version, 2);

    // The original record now carries a stale version.
    match storage.cas_by_version(created).await {
        Err(StorageError::WrongVersion { current }) => {
            assert_eq!(current.version, 2);
            assert_eq!(current.value, Payload::Json(serde_json::json!("v2")));
        }
        other => panic!("expected WrongVersion, got {:?}", other),
    }

    assert!(matches!(
        storage
            .cas_by_version(json_record("missing", serde_json::json!("v")))
            .await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn test_delete_checks_version() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(json_record("k", serde_json::json!("v1")))
        .await
        .unwrap();

    let mut stale = created.clone();
    stale.version += 1;
    match storage.delete(stale).await {
        Err(StorageError::WrongVersion { current }) => assert_eq!(current.version, 1),
        other => panic!("expected WrongVersion, got {:?}", other),
    }

    storage.delete(created.clone()).await.unwrap();
    assert!(matches!(storage.get("k").await, Err(StorageError::NotFound)));
    assert!(matches!(
        storage.delete(created).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn test_returned_records_are_snapshots() {
    let storage = MemoryStorage::new();
    storage
        .create(json_record("k", serde_json::json!({ "name": "original" })))
        .await
        .unwrap();

    let mut got = storage.get("k").await.unwrap();
    if let Payload::Json(value) = &mut got.value {
        value["name"] = serde_json::json!("mutated");
    }

    let again = storage.get("k").await.unwrap();
    assert_eq!(
        again.value,
        Payload::Json(serde_json::json!({ "name": "original" }))
    );
}

#[tokio::test]
async fn test_ttl_is_reported_remaining_and_swept() {
    let storage = MemoryStorage::new();
    storage
        .create(Record::new(
            "k",
            Payload::Sentinel,
            Duration::from_millis(50),
        ))
        .await
        .unwrap();

    let got = storage.get("k").await.unwrap();
    assert!(got.ttl > Duration::ZERO);
    assert!(got.ttl <= Duration::from_millis(50));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(storage.get("k").await, Err(StorageError::NotFound)));
}

#[tokio::test]
async fn test_cas_restarts_ttl_clock() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(Record::new(
            "k",
            Payload::Sentinel,
            Duration::from_millis(60),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let mut refresh = storage.get("k").await.unwrap();
    refresh.ttl = Duration::from_millis(60);
    storage.cas_by_version(refresh).await.unwrap();

    // Without the refresh the record would be gone by now.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let got = storage.get("k").await.unwrap();
    assert_eq!(got.version, 2);
    assert_eq!(created.version, 1);
}

#[tokio::test]
async fn test_wait_version_change_times_out_unchanged() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(json_record("k", serde_json::json!("v")))
        .await
        .unwrap();

    let start = Instant::now();
    let record = storage
        .wait_version_change("k", created.version, Duration::from_millis(30))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(record.version, 1);
}

#[tokio::test]
async fn test_wait_version_change_wakes_on_cas() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(json_record("k", serde_json::json!("v1")))
        .await
        .unwrap();

    let watcher = storage.clone();
    let waiter = tokio::spawn(async move {
        watcher
            .wait_version_change("k", 1, Duration::from_secs(5))
            .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut next = created;
    next.value = Payload::Json(serde_json::json!("v2"));
    storage.cas_by_version(next).await.unwrap();

    // Well before the five second budget.
    let record = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.value, Payload::Json(serde_json::json!("v2")));
}

#[tokio::test]
async fn test_wait_version_change_returns_immediately_on_mismatch() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(json_record("k", serde_json::json!("v1")))
        .await
        .unwrap();
    let mut next = created;
    next.value = Payload::Json(serde_json::json!("v2"));
    storage.cas_by_version(next).await.unwrap();

    match storage
        .wait_version_change("k", 1, Duration::from_secs(5))
        .await
    {
        Err(StorageError::WrongVersion { current }) => assert_eq!(current.version, 2),
        other => panic!("expected WrongVersion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_version_change_wakes_on_delete() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(json_record("k", serde_json::json!("v")))
        .await
        .unwrap();

    let watcher = storage.clone();
    let waiter = tokio::spawn(async move {
        watcher
            .wait_version_change("k", 1, Duration::from_secs(5))
            .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    storage.delete(created).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StorageError::NotFound)));
}

#[tokio::test]
async fn test_close_fails_everything_and_releases_waiters() {
    let storage = MemoryStorage::new();
    let created = storage
        .create(json_record("k", serde_json::json!("v")))
        .await
        .unwrap();

    let watcher = storage.clone();
    let waiter = tokio::spawn(async move {
        watcher
            .wait_version_change("k", 1, Duration::from_secs(5))
            .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    storage.close().await;

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StorageError::Closed)));

    assert!(matches!(
        storage.create(json_record("k2", serde_json::json!("v"))).await,
        Err(StorageError::Closed)
    ));
    assert!(matches!(storage.get("k").await, Err(StorageError::Closed)));
    assert!(matches!(
        storage.cas_by_version(created.clone()).await,
        Err(StorageError::Closed)
    ));
    assert!(matches!(
        storage.delete(created).await,
        Err(StorageError::Closed)
    ));
    assert!(matches!(
        storage
            .wait_version_change("k", 1, Duration::from_millis(10))
            .await,
        Err(StorageError::Closed)
    ));

    // Closing again is a no-op.
    storage.close().await;
}
