//! RedisPersistenceStore integration tests using testcontainers.
//! Requires Docker: `cargo test --features redis -- --ignored`

#![cfg(feature = "redis")]

use chrono::{DateTime, Utc};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::{Redis, REDIS_PORT};

use k1s0_idempotency_coordinator::{
    DataRecord, DataRecordStatus, IdempotencyError, PersistenceStore, RecordAttributes,
    RedisPersistenceStore,
};

async fn setup_store() -> (RedisPersistenceStore, ContainerAsync<Redis>) {
    let container = Redis::default().start().await.unwrap();
    let host_port = container.get_host_port_ipv4(REDIS_PORT).await.unwrap();
    let url = format!("redis://127.0.0.1:{}", host_port);
    let store = RedisPersistenceStore::new(&url, RecordAttributes::default())
        .await
        .unwrap();
    (store, container)
}

// Redis 側の EXPIREAT で消えないよう、実時刻を基準にする
fn base() -> i64 {
    Utc::now().timestamp()
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_live_record_conflicts() {
    let (store, _container) = setup_store().await;
    let t = base();
    store
        .put_record(&DataRecord::in_progress("live", t + 600, "h"), at(t))
        .await
        .unwrap();

    let result = store
        .put_record(&DataRecord::in_progress("live", t + 900, "h"), at(t + 1))
        .await;
    assert!(matches!(result, Err(IdempotencyError::AlreadyExists { .. })));

    let fetched = store.get_record("live").await.unwrap();
    assert_eq!(fetched.expiry_timestamp, t + 600);
    assert_eq!(fetched.payload_hash, "h");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_expiry_boundary_and_replacement() {
    let (store, _container) = setup_store().await;
    let t = base();
    store
        .put_record(&DataRecord::in_progress("edge", t + 100, ""), at(t))
        .await
        .unwrap();

    // now == expiry はまだ有効
    let result = store
        .put_record(&DataRecord::in_progress("edge", t + 500, ""), at(t + 100))
        .await;
    assert!(matches!(result, Err(IdempotencyError::AlreadyExists { .. })));

    store
        .put_record(&DataRecord::in_progress("edge", t + 500, ""), at(t + 101))
        .await
        .unwrap();
    assert_eq!(store.get_record("edge").await.unwrap().expiry_timestamp, t + 500);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_fence_rejected_after_reclaim() {
    let (store, _container) = setup_store().await;
    let t = base();
    store
        .put_record(&DataRecord::in_progress("fenced", t + 10, ""), at(t))
        .await
        .unwrap();
    store
        .put_record(&DataRecord::in_progress("fenced", t + 600, ""), at(t + 11))
        .await
        .unwrap();

    let stale = DataRecord::completed("fenced", t + 3600, "\"late\"", "");
    let result = store.update_record(&stale, Some(t + 10)).await;
    assert!(matches!(result, Err(IdempotencyError::InconsistentState { .. })));
    let result = store.delete_record("fenced", Some(t + 10)).await;
    assert!(matches!(result, Err(IdempotencyError::InconsistentState { .. })));

    let fresh = DataRecord::completed("fenced", t + 3600, "\"ok\"", "");
    store.update_record(&fresh, Some(t + 600)).await.unwrap();
    let fetched = store.get_record("fenced").await.unwrap();
    assert_eq!(fetched.stored_status(), DataRecordStatus::Completed);
    assert_eq!(fetched.response_data.as_deref(), Some("\"ok\""));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_fenced_release_and_idempotent_delete() {
    let (store, _container) = setup_store().await;
    let t = base();
    store
        .put_record(&DataRecord::in_progress("release", t + 60, ""), at(t))
        .await
        .unwrap();

    store.delete_record("release", Some(t + 60)).await.unwrap();
    assert!(matches!(
        store.get_record("release").await,
        Err(IdempotencyError::NotFound { .. })
    ));
    store.delete_record("release", None).await.unwrap();
    store.delete_record("release", None).await.unwrap();
}
