//! 冪等処理のライフサイクルを制御するコーディネーター。
//!
//! キー導出、キャッシュ・ストア参照、処理中レコードの設置（競合の検出）、
//! 成功時の確定、失敗時の解放を順に行う。プロセス間の協調はストアの
//! 条件付き作成のみに依存し、ローカルキャッシュは一意性の判定に使わない。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::cache::LocalCache;
use crate::config::IdempotencyConfig;
use crate::error::{IdempotencyError, Result};
use crate::extractor::{JsonPathExtractor, KeyExtractor};
use crate::hash;
use crate::key::KeyBuilder;
use crate::record::{DataRecord, DataRecordStatus};
use crate::store::PersistenceStore;

/// ワーカーごとに一度構築し、呼び出し元へ明示的に渡して使う。
pub struct IdempotencyCoordinator {
    function_name: String,
    store: Arc<dyn PersistenceStore>,
    extractor: Arc<dyn KeyExtractor>,
    config: IdempotencyConfig,
    key_builder: KeyBuilder,
    cache: Option<LocalCache>,
}

impl fmt::Debug for IdempotencyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyCoordinator")
            .field("function_name", &self.function_name)
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish()
    }
}

impl IdempotencyCoordinator {
    /// `function_name` はキーのスコープ（プレフィックス）になる安定した操作名。
    pub fn new(
        function_name: impl Into<String>,
        store: Arc<dyn PersistenceStore>,
        config: IdempotencyConfig,
    ) -> Result<Self> {
        let function_name = function_name.into();
        if function_name.is_empty() {
            return Err(IdempotencyError::Config(
                "function_name is required".into(),
            ));
        }
        let extractor: Arc<dyn KeyExtractor> = Arc::new(JsonPathExtractor);
        config.validate()?;
        Ok(Self {
            key_builder: build_key_builder(&function_name, &config, extractor.clone()),
            cache: build_cache(&config)?,
            function_name,
            store,
            extractor,
            config,
        })
    }

    /// キー抽出の実装を差し替える。
    pub fn with_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.key_builder = build_key_builder(&self.function_name, &self.config, extractor.clone());
        self.extractor = extractor;
        self
    }

    /// 設定を置き換える。ローカルキャッシュは作り直される。
    pub fn configure(&mut self, config: IdempotencyConfig) -> Result<()> {
        config.validate()?;
        self.cache = build_cache(&config)?;
        self.key_builder = build_key_builder(&self.function_name, &config, self.extractor.clone());
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn key_builder(&self) -> &KeyBuilder {
        &self.key_builder
    }

    pub fn local_cache(&self) -> Option<&LocalCache> {
        self.cache.as_ref()
    }

    pub fn generate_hash(value: &Value) -> String {
        hash::generate_hash(value)
    }

    /// 処理中レコードを設置する。
    ///
    /// 有効期限内のレコードが既にあれば Err(AlreadyExists) を返す。
    /// 成功時は設置したレコードを返す（`complete_in_progress` のフェンスに使う）。
    pub async fn save_in_progress(&self, document: &Value, now: DateTime<Utc>) -> Result<DataRecord> {
        let (key, validation_hash) = self.key_builder.build(document)?;

        if let Some(cache) = &self.cache {
            if cache.get_live(&key, now).is_some() {
                tracing::debug!(key = %key, "live record found in local cache");
                return Err(IdempotencyError::AlreadyExists { key });
            }
        }

        let expiry = expiry_after(now, self.config.in_progress_expiration());
        let record = DataRecord::in_progress(key, expiry, validation_hash);
        match self.store.put_record(&record, now).await {
            Ok(()) => {
                tracing::debug!(
                    key = %record.idempotency_key,
                    expiry = record.expiry_timestamp,
                    "in-progress record installed"
                );
                Ok(record)
            }
            Err(e) => {
                if e.is_already_exists() {
                    tracing::debug!(key = %record.idempotency_key, "idempotency key already owned");
                }
                Err(e)
            }
        }
    }

    /// 既存レコードを取得する。存在しない・期限切れの場合は `Ok(None)`。
    pub async fn get_record(
        &self,
        document: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<DataRecord>> {
        let key = self.key_builder.idempotency_key(document)?;

        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get_live(&key, now) {
                tracing::debug!(key = %key, "local cache hit");
                self.validate_payload(document, &record)?;
                return Ok(Some(record));
            }
        }

        let record = match self.store.get_record(&key).await {
            Ok(record) => record,
            Err(IdempotencyError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        if record.is_expired(now) {
            tracing::warn!(
                key = %key,
                expiry = record.expiry_timestamp,
                "expired idempotency record treated as absent"
            );
            if let Some(cache) = &self.cache {
                cache.remove(&key);
            }
            return Ok(None);
        }

        self.save_to_cache(&record);
        self.validate_payload(document, &record)?;
        Ok(Some(record))
    }

    /// 処理結果を記録して COMPLETED に遷移させる（無条件上書き）。
    pub async fn save_success<R: Serialize + ?Sized>(
        &self,
        document: &Value,
        result: &R,
        now: DateTime<Utc>,
    ) -> Result<DataRecord> {
        let (key, validation_hash) = self.key_builder.build(document)?;
        let record = self.completed_record(key, validation_hash, result, now)?;
        self.store.update_record(&record, None).await?;
        self.save_to_cache(&record);
        tracing::debug!(key = %record.idempotency_key, "record completed");
        Ok(record)
    }

    /// `save_in_progress` で設置したスロットを COMPLETED に遷移させる。
    ///
    /// スロットが期限切れ後に別の呼び出しに再取得されていれば Err(InconsistentState)。
    pub async fn complete_in_progress<R: Serialize + ?Sized>(
        &self,
        in_progress: &DataRecord,
        result: &R,
        now: DateTime<Utc>,
    ) -> Result<DataRecord> {
        let record = self.completed_record(
            in_progress.idempotency_key.clone(),
            in_progress.payload_hash.clone(),
            result,
            now,
        )?;
        self.store
            .update_record(&record, Some(in_progress.expiry_timestamp))
            .await?;
        self.save_to_cache(&record);
        tracing::debug!(key = %record.idempotency_key, "in-progress slot completed");
        Ok(record)
    }

    /// キーのレコードを無条件に削除する。
    pub async fn delete_record(
        &self,
        document: &Value,
        cause: &(dyn fmt::Display + Sync),
    ) -> Result<()> {
        let key = self.key_builder.idempotency_key(document)?;
        tracing::debug!(key = %key, cause = %cause, "deleting idempotency record");
        let deleted = self.store.delete_record(&key, None).await;
        if let Some(cache) = &self.cache {
            cache.remove(&key);
        }
        deleted
    }

    /// `save_in_progress` で設置したスロットを解放する。
    ///
    /// スロットが期限切れ後に別の呼び出しに再取得されていれば、そのレコードには
    /// 触れずに Err(InconsistentState) を返す。キャッシュは COMPLETED のみを
    /// 保持するため変更しない。
    pub async fn release_in_progress(
        &self,
        in_progress: &DataRecord,
        cause: &(dyn fmt::Display + Sync),
    ) -> Result<()> {
        tracing::debug!(
            key = %in_progress.idempotency_key,
            cause = %cause,
            "releasing in-progress slot"
        );
        self.store
            .delete_record(
                &in_progress.idempotency_key,
                Some(in_progress.expiry_timestamp),
            )
            .await
    }

    fn completed_record<R: Serialize + ?Sized>(
        &self,
        key: String,
        validation_hash: String,
        result: &R,
        now: DateTime<Utc>,
    ) -> Result<DataRecord> {
        let data = serde_json::to_string(result)?;
        let expiry = expiry_after(now, self.config.expiration());
        Ok(DataRecord::completed(key, expiry, data, validation_hash))
    }

    fn save_to_cache(&self, record: &DataRecord) {
        // 処理中レコードはキャッシュしない
        if record.stored_status() != DataRecordStatus::Completed {
            return;
        }
        if let Some(cache) = &self.cache {
            cache.set(record.idempotency_key.clone(), record.clone());
        }
    }

    fn validate_payload(&self, document: &Value, record: &DataRecord) -> Result<()> {
        if !self.key_builder.validation_enabled() || record.payload_hash.is_empty() {
            return Ok(());
        }
        let current = self.key_builder.validation_hash(document)?;
        if current != record.payload_hash {
            tracing::warn!(key = %record.idempotency_key, "payload hash mismatch");
            return Err(IdempotencyError::ValidationError {
                key: record.idempotency_key.clone(),
            });
        }
        Ok(())
    }
}

fn build_key_builder(
    function_name: &str,
    config: &IdempotencyConfig,
    extractor: Arc<dyn KeyExtractor>,
) -> KeyBuilder {
    KeyBuilder::new(function_name)
        .with_sub_scope(config.scope.as_deref())
        .with_event_key_path(config.event_key_path.clone())
        .with_payload_validation_path(config.payload_validation_path.clone())
        .with_fail_on_missing_key(config.fail_on_missing_key)
        .with_extractor(extractor)
}

fn build_cache(config: &IdempotencyConfig) -> Result<Option<LocalCache>> {
    if config.use_local_cache {
        LocalCache::new(config.local_cache_capacity).map(Some)
    } else {
        Ok(None)
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> i64 {
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    now.timestamp().saturating_add(ttl_secs)
}
