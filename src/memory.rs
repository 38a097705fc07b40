use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{IdempotencyError, Result};
use crate::record::{DataRecord, DataRecordStatus};
use crate::store::PersistenceStore;

/// 単一プロセス向けのインメモリストア。
///
/// 条件付き作成はマップ全体のロック内で判定と書き込みを行うため原子的。
#[derive(Clone, Default)]
pub struct InMemoryPersistenceStore {
    data: Arc<Mutex<HashMap<String, DataRecord>>>,
}

impl InMemoryPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `now` 時点で期限切れのレコードを除去し、除去件数を返す。
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.data.lock().await;
        let before = map.len();
        map.retain(|_, record| !record.is_expired(now));
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.data.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.lock().await.is_empty()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryPersistenceStore {
    async fn get_record(&self, key: &str) -> Result<DataRecord> {
        let map = self.data.lock().await;
        map.get(key).cloned().ok_or_else(|| IdempotencyError::NotFound {
            key: key.to_string(),
        })
    }

    async fn put_record(&self, record: &DataRecord, now: DateTime<Utc>) -> Result<()> {
        let mut map = self.data.lock().await;
        if let Some(existing) = map.get(&record.idempotency_key) {
            if !existing.is_expired(now) {
                return Err(IdempotencyError::AlreadyExists {
                    key: record.idempotency_key.clone(),
                });
            }
        }
        map.insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &DataRecord, fence: Option<i64>) -> Result<()> {
        let mut map = self.data.lock().await;
        if let Some(expected_expiry) = fence {
            if !is_owned_slot(map.get(&record.idempotency_key), expected_expiry) {
                return Err(IdempotencyError::InconsistentState {
                    key: record.idempotency_key.clone(),
                    reason: "処理中スロットが既に解放または再取得されています".to_string(),
                });
            }
        }
        map.insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn delete_record(&self, key: &str, fence: Option<i64>) -> Result<()> {
        let mut map = self.data.lock().await;
        if let Some(expected_expiry) = fence {
            if !is_owned_slot(map.get(key), expected_expiry) {
                return Err(IdempotencyError::InconsistentState {
                    key: key.to_string(),
                    reason: "処理中スロットが既に解放または再取得されています".to_string(),
                });
            }
        }
        map.remove(key);
        Ok(())
    }
}

fn is_owned_slot(existing: Option<&DataRecord>, expected_expiry: i64) -> bool {
    existing.is_some_and(|record| {
        record.stored_status() == DataRecordStatus::InProgress
            && record.expiry_timestamp == expected_expiry
    })
}
