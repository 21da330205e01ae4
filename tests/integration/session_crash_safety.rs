//! Session records survive torn writes, tampering and crashed lock holders.

use std::time::{Duration, SystemTime};

use vigil::FsSessionStore;
use vigil::persist::{backup_path_for, temp_path_for};
use vigil::session::{SessionKey, SessionRecord};

fn store(dir: &tempfile::TempDir) -> FsSessionStore {
    FsSessionStore::new(dir.path())
        .expect("create store")
        .with_lock_timeout(Duration::from_millis(50))
}

async fn set_counter(store: &FsSessionStore, value: i64) {
    let key = SessionKey::primary("ops");
    store
        .mutate(&key, move |record| {
            record.variables.insert("counter".into(), value.into());
        })
        .await
        .unwrap()
        .acquired()
        .expect("not busy");
}

async fn load(store: &FsSessionStore) -> Option<SessionRecord> {
    store.load("ops.primary").await.unwrap().acquired().expect("not busy")
}

#[tokio::test]
async fn torn_current_file_falls_back_to_previous_generation() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    set_counter(&store, 1).await;
    set_counter(&store, 2).await;

    let path = store.record_path("ops.primary");
    assert!(backup_path_for(&path).exists());
    let current = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, &current[..current.len() / 2]).unwrap();

    let record = load(&store).await.expect("recovered from backup");
    assert_eq!(record.revision, 1);
    assert_eq!(record.variables["counter"], serde_json::json!(1));

    // The next mutation builds on the recovered generation.
    set_counter(&store, 3).await;
    let record = load(&store).await.unwrap();
    assert_eq!(record.revision, 2);
    assert_eq!(record.variables["counter"], serde_json::json!(3));
}

#[tokio::test]
async fn tampered_record_fails_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    set_counter(&store, 1).await;
    set_counter(&store, 2).await;

    let path = store.record_path("ops.primary");
    let mut json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    json["variables"]["counter"] = serde_json::json!(99);
    std::fs::write(&path, serde_json::to_string_pretty(&json).unwrap()).unwrap();

    let record = load(&store).await.unwrap();
    assert_eq!(record.variables["counter"], serde_json::json!(1));
}

#[tokio::test]
async fn leftover_temp_file_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    set_counter(&store, 1).await;

    let path = store.record_path("ops.primary");
    std::fs::write(temp_path_for(&path), "{\"session_id\": \"ops.prim").unwrap();

    assert_eq!(
        load(&store).await.unwrap().variables["counter"],
        serde_json::json!(1)
    );
    set_counter(&store, 2).await;
    assert_eq!(
        load(&store).await.unwrap().variables["counter"],
        serde_json::json!(2)
    );
}

#[tokio::test]
async fn both_generations_unusable_means_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    set_counter(&store, 1).await;
    set_counter(&store, 2).await;

    let path = store.record_path("ops.primary");
    std::fs::write(&path, "garbage").unwrap();
    std::fs::write(backup_path_for(&path), "also garbage").unwrap();

    assert!(load(&store).await.is_none());
    set_counter(&store, 7).await;
    let record = load(&store).await.unwrap();
    assert_eq!(record.revision, 1);
    assert_eq!(record.variables["counter"], serde_json::json!(7));
}

#[tokio::test]
async fn lock_is_shared_across_store_instances() {
    let dir = tempfile::tempdir().unwrap();
    // Two stores over one directory stand in for two processes.
    let first = store(&dir);
    let second = store(&dir);

    let lease = first
        .lease("ops.primary", Duration::from_millis(50))
        .await
        .unwrap()
        .expect("first lease");
    assert!(
        second
            .lease("ops.primary", Duration::from_millis(50))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        second
            .mutate(&SessionKey::primary("ops"), |_| ())
            .await
            .unwrap()
            .is_busy()
    );

    drop(lease);
    assert!(
        second
            .lease("ops.primary", Duration::from_millis(50))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn abandoned_lock_file_is_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir).with_stale_lock_after(Duration::from_secs(60));

    let lock_path = dir.path().join("ops.primary.lock");
    std::fs::write(&lock_path, "4242 2026-01-01T00:00:00Z").unwrap();
    let fresh = store
        .lease("ops.primary", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(fresh.is_none(), "a fresh lock file must be respected");

    std::fs::File::options()
        .write(true)
        .open(&lock_path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();
    let lease = store
        .lease("ops.primary", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(lease.is_some());
}
