use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{IdempotencyError, Result};
use crate::record::DataRecord;

/// プロセスローカルの LRU キャッシュ。
///
/// 権威を持たないため、ヒットしても呼び出し側で必ず有効期限を確認すること。
/// プロセス間の一意性判定には使わない。
pub struct LocalCache {
    entries: Mutex<LruCache<String, DataRecord>>,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            IdempotencyError::Config("local_cache_capacity must be > 0".to_string())
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// 値のコピーを返す。参照は最近使用として更新される。
    pub fn try_get(&self, key: &str) -> Option<DataRecord> {
        self.entries.lock().get(key).cloned()
    }

    /// 有効期限切れのエントリは削除してミスとして扱う。
    pub fn get_live(&self, key: &str, now: DateTime<Utc>) -> Option<DataRecord> {
        let mut entries = self.entries.lock();
        let record = entries.get(key)?.clone();
        if record.is_expired(now) {
            tracing::debug!(key = %key, "evicting expired record from local cache");
            entries.pop(key);
            return None;
        }
        Some(record)
    }

    /// 容量超過時は最も長く使われていないエントリを追い出す。
    pub fn set(&self, key: impl Into<String>, record: DataRecord) {
        self.entries.lock().put(key.into(), record);
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
