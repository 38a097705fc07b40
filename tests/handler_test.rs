use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;

use k1s0_idempotency_coordinator::{
    with_idempotency, DataRecord, HandlerError, IdempotencyConfig, IdempotencyCoordinator,
    IdempotencyError, IdempotencyHandler, InMemoryPersistenceStore, PersistenceStore,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Receipt {
    order_id: String,
    charged: u64,
}

fn coordinator(config: IdempotencyConfig) -> Arc<IdempotencyCoordinator> {
    let store = Arc::new(InMemoryPersistenceStore::new());
    Arc::new(IdempotencyCoordinator::new("charge", store, config).unwrap())
}

#[tokio::test]
async fn test_second_call_replays_recorded_result() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let charge = with_idempotency(
        coordinator(IdempotencyConfig::default().with_event_key_path("order_id")),
        move |doc: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(Receipt {
                    order_id: doc["order_id"].as_str().unwrap_or_default().to_string(),
                    charged: doc["amount"].as_u64().unwrap_or_default(),
                })
            }
        },
    );

    let first = charge(json!({"order_id": "o-1", "amount": 500})).await.unwrap();
    let second = charge(json!({"order_id": "o-1", "amount": 500})).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.charged, 500);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_error_releases_slot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = with_idempotency(coordinator(IdempotencyConfig::default()), move |_doc: Value| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err("gateway timeout".to_string())
            } else {
                Ok(json!({"ok": true}))
            }
        }
    });

    let err = flaky(json!({"id": 1})).await.unwrap_err();
    assert!(matches!(err, HandlerError::Handler(ref msg) if msg == "gateway timeout"));

    // スロットは解放されているので再実行される
    let ok = flaky(json!({"id": 1})).await.unwrap();
    assert_eq!(ok, json!({"ok": true}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_duplicate_while_in_progress_is_rejected() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (started_tx, release_rx) = (started.clone(), release.clone());

    let slow = with_idempotency(coordinator(IdempotencyConfig::default()), move |_doc: Value| {
        let started = started_tx.clone();
        let release = release_rx.clone();
        async move {
            started.notify_one();
            release.notified().await;
            Ok::<_, String>(7u32)
        }
    });

    let first = tokio::spawn({
        let slow = slow.clone();
        async move { slow(json!({"id": "long"})).await }
    });
    started.notified().await;

    let err = slow(json!({"id": "long"})).await.unwrap_err();
    assert!(matches!(
        err,
        HandlerError::Idempotency(IdempotencyError::AlreadyExists { .. })
    ));

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), 7);
    // 完了後はリプレイされる
    assert_eq!(slow(json!({"id": "long"})).await.unwrap(), 7);
}

#[tokio::test]
async fn test_key_error_skips_work() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = IdempotencyHandler::new(
        coordinator(
            IdempotencyConfig::default()
                .with_event_key_path("missing")
                .with_fail_on_missing_key(true),
        ),
        move |_doc: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        },
    );

    let err = handler.handle(json!({"id": 1})).await.unwrap_err();
    assert!(matches!(
        err,
        HandlerError::Idempotency(IdempotencyError::KeyError { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_injected_clock_expires_recorded_result() {
    let now = Arc::new(AtomicUsize::new(1_000));
    let clock_source = now.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let handler = IdempotencyHandler::new(
        coordinator(IdempotencyConfig::default().with_expiration(std::time::Duration::from_secs(30))),
        move |_doc: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("done".to_string()) }
        },
    )
    .with_clock(Arc::new(move || {
        chrono::DateTime::from_timestamp(clock_source.load(Ordering::SeqCst) as i64, 0).unwrap()
    }));

    handler.handle(json!({"id": 1})).await.unwrap();
    handler.handle(json!({"id": 1})).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    now.store(1_031, Ordering::SeqCst);
    handler.handle(json!({"id": 1})).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn fixed_clock(now: Arc<AtomicI64>) -> k1s0_idempotency_coordinator::handler::Clock {
    Arc::new(move || DateTime::from_timestamp(now.load(Ordering::SeqCst), 0).unwrap())
}

#[tokio::test]
async fn test_late_failure_does_not_release_reacquired_slot() {
    let now = Arc::new(AtomicI64::new(1_000));
    let store = Arc::new(InMemoryPersistenceStore::new());
    let coordinator = Arc::new(
        IdempotencyCoordinator::new(
            "charge",
            store,
            IdempotencyConfig::default().with_in_progress_expiration(Duration::from_secs(10)),
        )
        .unwrap(),
    );
    let document = json!({"order_id": "o-9"});

    // 処理が長引いてスロットが期限切れになり、別の呼び出しが再取得してから失敗する
    let work_clock = now.clone();
    let work_coordinator = coordinator.clone();
    let handler = IdempotencyHandler::new(coordinator.clone(), move |doc: Value| {
        let clock = work_clock.clone();
        let coordinator = work_coordinator.clone();
        async move {
            clock.store(1_011, Ordering::SeqCst);
            coordinator
                .save_in_progress(&doc, DateTime::from_timestamp(1_011, 0).unwrap())
                .await
                .map_err(|e| e.to_string())?;
            Err::<u32, _>("upstream failed".to_string())
        }
    })
    .with_clock(fixed_clock(now.clone()));

    let err = handler.handle(document.clone()).await.unwrap_err();
    assert!(matches!(err, HandlerError::Handler(ref msg) if msg == "upstream failed"));

    // 再取得した側のスロットはまだ有効
    let third = coordinator
        .save_in_progress(&document, DateTime::from_timestamp(1_012, 0).unwrap())
        .await;
    assert!(matches!(third, Err(IdempotencyError::AlreadyExists { .. })));
}

/// 結果の記録だけが失敗するストア
struct FailingCompletionStore {
    inner: InMemoryPersistenceStore,
}

#[async_trait]
impl PersistenceStore for FailingCompletionStore {
    async fn get_record(&self, key: &str) -> k1s0_idempotency_coordinator::error::Result<DataRecord> {
        self.inner.get_record(key).await
    }

    async fn put_record(
        &self,
        record: &DataRecord,
        now: DateTime<Utc>,
    ) -> k1s0_idempotency_coordinator::error::Result<()> {
        self.inner.put_record(record, now).await
    }

    async fn update_record(
        &self,
        _record: &DataRecord,
        _fence: Option<i64>,
    ) -> k1s0_idempotency_coordinator::error::Result<()> {
        Err(IdempotencyError::Persistence("write timeout".to_string()))
    }

    async fn delete_record(
        &self,
        key: &str,
        fence: Option<i64>,
    ) -> k1s0_idempotency_coordinator::error::Result<()> {
        self.inner.delete_record(key, fence).await
    }
}

fn failing_completion_coordinator(config: IdempotencyConfig) -> Arc<IdempotencyCoordinator> {
    let store = Arc::new(FailingCompletionStore {
        inner: InMemoryPersistenceStore::new(),
    });
    Arc::new(IdempotencyCoordinator::new("charge", store, config).unwrap())
}

#[tokio::test]
async fn test_completion_failure_keeps_slot_by_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let charge = with_idempotency(
        failing_completion_coordinator(IdempotencyConfig::default()),
        move |_doc: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(1u32) }
        },
    );

    let err = charge(json!({"id": 1})).await.unwrap_err();
    assert!(matches!(
        err,
        HandlerError::Idempotency(IdempotencyError::Persistence(_))
    ));
    let retry = charge(json!({"id": 1})).await.unwrap_err();
    assert!(matches!(
        retry,
        HandlerError::Idempotency(IdempotencyError::AlreadyExists { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completion_failure_releases_slot_when_enabled() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let charge = with_idempotency(
        failing_completion_coordinator(
            IdempotencyConfig::default().with_release_on_completion_failure(true),
        ),
        move |_doc: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(1u32) }
        },
    );

    assert!(charge(json!({"id": 1})).await.is_err());
    assert!(charge(json!({"id": 1})).await.is_err());
    // スロットが解放されるので処理は再実行される
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
