use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::coordinator::IdempotencyCoordinator;
use crate::error::{HandlerError, IdempotencyError};
use crate::record::{DataRecord, DataRecordStatus};

/// レコードが競合直後に消えていた場合の再試行回数。
const MAX_RETRIES: usize = 1;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// 任意の非同期処理を冪等に実行するラッパー。
pub struct IdempotencyHandler<F> {
    coordinator: Arc<IdempotencyCoordinator>,
    work: F,
    clock: Clock,
}

impl<F> IdempotencyHandler<F> {
    pub fn new(coordinator: Arc<IdempotencyCoordinator>, work: F) -> Self {
        Self {
            coordinator,
            work,
            clock: Arc::new(Utc::now),
        }
    }

    /// 現在時刻の取得元を差し替える。
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl<F, Fut, R, E> IdempotencyHandler<F>
where
    F: Fn(Value) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Serialize + DeserializeOwned,
    E: fmt::Display + Sync,
{
    /// 1. 処理中レコードを設置する
    /// 2. 競合した場合は既存レコードを返す（処理済みなら結果を復元、処理中なら AlreadyExists）
    /// 3. 処理を実行し、成功なら結果を記録、失敗ならレコードを削除して元のエラーを返す
    pub async fn handle(&self, document: Value) -> Result<R, HandlerError<E>> {
        for attempt in 0..=MAX_RETRIES {
            let now = (self.clock)();
            match self.coordinator.save_in_progress(&document, now).await {
                Ok(slot) => return self.run(document, slot).await,
                Err(e) if e.is_already_exists() => {
                    match self.coordinator.get_record(&document, now).await? {
                        Some(record) => return replay(record, now),
                        None => {
                            tracing::debug!(
                                attempt,
                                "idempotency record disappeared after conflict, retrying"
                            );
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let key = self.coordinator.key_builder().idempotency_key(&document)?;
        Err(IdempotencyError::InconsistentState {
            key,
            reason: "競合したレコードを取得できませんでした".to_string(),
        }
        .into())
    }

    async fn run(&self, document: Value, slot: DataRecord) -> Result<R, HandlerError<E>> {
        match (self.work)(document).await {
            Ok(result) => {
                let completed = self
                    .coordinator
                    .complete_in_progress(&slot, &result, (self.clock)())
                    .await;
                if let Err(e) = completed {
                    tracing::error!(
                        key = %slot.idempotency_key,
                        error = %e,
                        "failed to record result of successful handler"
                    );
                    if self.coordinator.config().release_on_completion_failure {
                        self.release(&slot, &e).await;
                    }
                    return Err(e.into());
                }
                Ok(result)
            }
            Err(e) => {
                self.release(&slot, &e).await;
                Err(HandlerError::Handler(e))
            }
        }
    }

    async fn release(&self, slot: &DataRecord, cause: &(dyn fmt::Display + Sync)) {
        if let Err(cleanup) = self.coordinator.release_in_progress(slot, cause).await {
            tracing::warn!(
                key = %slot.idempotency_key,
                error = %cleanup,
                "failed to release in-progress slot"
            );
        }
    }
}

fn replay<R: DeserializeOwned, E>(
    record: DataRecord,
    now: DateTime<Utc>,
) -> Result<R, HandlerError<E>> {
    match record.status(now) {
        DataRecordStatus::Completed => {
            let data = record.response_data.as_deref().ok_or_else(|| {
                IdempotencyError::InconsistentState {
                    key: record.idempotency_key.clone(),
                    reason: "COMPLETED レコードに結果がありません".to_string(),
                }
            })?;
            tracing::debug!(key = %record.idempotency_key, "replaying recorded result");
            serde_json::from_str(data).map_err(|e| HandlerError::Idempotency(e.into()))
        }
        DataRecordStatus::InProgress => Err(IdempotencyError::AlreadyExists {
            key: record.idempotency_key,
        }
        .into()),
        DataRecordStatus::Expired => Err(IdempotencyError::InconsistentState {
            key: record.idempotency_key,
            reason: "期限切れのレコードが返されました".to_string(),
        }
        .into()),
    }
}

pub type IdempotentFuture<R, E> = Pin<Box<dyn Future<Output = Result<R, HandlerError<E>>> + Send>>;

/// 処理を冪等化した関数を返す。
///
/// ```ignore
/// let coordinator = Arc::new(IdempotencyCoordinator::new("create_order", store, config)?);
/// let create = with_idempotency(coordinator, |doc| async move { create_order(doc).await });
/// let order = create(request_json).await?;
/// ```
pub fn with_idempotency<F, Fut, R, E>(
    coordinator: Arc<IdempotencyCoordinator>,
    work: F,
) -> impl Fn(Value) -> IdempotentFuture<R, E> + Clone
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    let handler = Arc::new(IdempotencyHandler::new(coordinator, work));
    move |document: Value| -> IdempotentFuture<R, E> {
        let handler = handler.clone();
        Box::pin(async move { handler.handle(document).await })
    }
}
