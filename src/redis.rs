use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::error::{IdempotencyError, Result};
use crate::record::{DataRecord, DataRecordStatus};
use crate::store::{PersistenceStore, RecordAttributes};

/// Redis-backed persistence store.
///
/// Each record is a hash stored under `{table}:{idempotency_key}`. The
/// conditional create and the fenced completion run as Lua scripts, so the
/// check and the write are atomic on the server.
#[derive(Clone)]
pub struct RedisPersistenceStore {
    conn: MultiplexedConnection,
    attributes: RecordAttributes,
}

impl RedisPersistenceStore {
    /// Create a new RedisPersistenceStore from a Redis URL.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(url: &str, attributes: RecordAttributes) -> Result<Self> {
        attributes.validate()?;
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self { conn, attributes })
    }

    /// Create a new RedisPersistenceStore from an existing multiplexed connection.
    pub fn from_connection(
        conn: MultiplexedConnection,
        attributes: RecordAttributes,
    ) -> Result<Self> {
        attributes.validate()?;
        Ok(Self { conn, attributes })
    }

    fn record_key(&self, key: &str) -> String {
        format_record_key(&self.attributes.table, key)
    }

    /// Arguments shared by both scripts, starting at ARGV[2].
    fn record_args(&self, record: &DataRecord) -> Vec<String> {
        let attrs = &self.attributes;
        vec![
            attrs.status_attr.clone(),
            record.stored_status().as_str().to_string(),
            attrs.expiry_attr.clone(),
            record.expiry_timestamp.to_string(),
            attrs.validation_attr.clone(),
            record.payload_hash.clone(),
            attrs.data_attr.clone(),
            if record.response_data.is_some() { "1" } else { "0" }.to_string(),
            record.response_data.clone().unwrap_or_default(),
        ]
    }

    fn parse_record(&self, key: &str, fields: HashMap<String, String>) -> Result<DataRecord> {
        let attrs = &self.attributes;
        let field = |name: &str| {
            fields.get(name).cloned().ok_or_else(|| {
                IdempotencyError::Persistence(format!("フィールド {} がありません: key={}", name, key))
            })
        };
        let status = DataRecordStatus::parse(&field(attrs.status_attr.as_str())?)?;
        let expiry = field(attrs.expiry_attr.as_str())?.parse::<i64>().map_err(|e| {
            IdempotencyError::Persistence(format!("有効期限が不正です: key={}, {}", key, e))
        })?;
        DataRecord::from_parts(
            key.to_string(),
            status,
            expiry,
            fields.get(&attrs.data_attr).cloned(),
            fields
                .get(&attrs.validation_attr)
                .cloned()
                .unwrap_or_default(),
        )
    }
}

/// Lua script for the conditional create.
/// Writes only when no record exists or the stored expiry is before ARGV[1] (now).
const PUT_SCRIPT: &str = r#"
local expiry = redis.call("hget", KEYS[1], ARGV[4])
if expiry and tonumber(expiry) >= tonumber(ARGV[1]) then
    return 0
end
redis.call("del", KEYS[1])
redis.call("hset", KEYS[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5], ARGV[6], ARGV[7])
if ARGV[9] == "1" then
    redis.call("hset", KEYS[1], ARGV[8], ARGV[10])
end
redis.call("expireat", KEYS[1], tonumber(ARGV[5]) + 1)
return 1
"#;

/// Lua script for the overwrite.
/// When ARGV[1] is non-empty, writes only if the stored record is IN_PROGRESS
/// with exactly that expiry.
const UPDATE_SCRIPT: &str = r#"
if ARGV[1] ~= "" then
    local status = redis.call("hget", KEYS[1], ARGV[2])
    local expiry = redis.call("hget", KEYS[1], ARGV[4])
    if status ~= "IN_PROGRESS" or expiry ~= ARGV[1] then
        return 0
    end
end
redis.call("del", KEYS[1])
redis.call("hset", KEYS[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5], ARGV[6], ARGV[7])
if ARGV[9] == "1" then
    redis.call("hset", KEYS[1], ARGV[8], ARGV[10])
end
redis.call("expireat", KEYS[1], tonumber(ARGV[5]) + 1)
return 1
"#;

/// Lua script for the fenced release.
/// Deletes only if the stored record is IN_PROGRESS with expiry ARGV[3].
const RELEASE_SCRIPT: &str = r#"
if redis.call("hget", KEYS[1], ARGV[1]) == "IN_PROGRESS"
    and redis.call("hget", KEYS[1], ARGV[2]) == ARGV[3] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[async_trait]
impl PersistenceStore for RedisPersistenceStore {
    async fn get_record(&self, key: &str) -> Result<DataRecord> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.record_key(key))
            .await
            .map_err(map_redis_error)?;
        if fields.is_empty() {
            return Err(IdempotencyError::NotFound {
                key: key.to_string(),
            });
        }
        self.parse_record(key, fields)
    }

    async fn put_record(&self, record: &DataRecord, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let script = Script::new(PUT_SCRIPT);
        let mut invocation = script.key(self.record_key(&record.idempotency_key));
        invocation.arg(now.timestamp());
        for arg in self.record_args(record) {
            invocation.arg(arg);
        }
        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if written == 1 {
            Ok(())
        } else {
            Err(IdempotencyError::AlreadyExists {
                key: record.idempotency_key.clone(),
            })
        }
    }

    async fn update_record(&self, record: &DataRecord, fence: Option<i64>) -> Result<()> {
        let mut conn = self.conn.clone();
        let script = Script::new(UPDATE_SCRIPT);
        let mut invocation = script.key(self.record_key(&record.idempotency_key));
        invocation.arg(fence.map(|e| e.to_string()).unwrap_or_default());
        for arg in self.record_args(record) {
            invocation.arg(arg);
        }
        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if written == 1 {
            Ok(())
        } else {
            Err(IdempotencyError::InconsistentState {
                key: record.idempotency_key.clone(),
                reason: "処理中スロットが既に解放または再取得されています".to_string(),
            })
        }
    }

    async fn delete_record(&self, key: &str, fence: Option<i64>) -> Result<()> {
        let mut conn = self.conn.clone();
        let Some(expected_expiry) = fence else {
            let _: i64 = conn
                .del(self.record_key(key))
                .await
                .map_err(map_redis_error)?;
            return Ok(());
        };

        let script = Script::new(RELEASE_SCRIPT);
        let deleted: i64 = script
            .key(self.record_key(key))
            .arg(self.attributes.status_attr.as_str())
            .arg(self.attributes.expiry_attr.as_str())
            .arg(expected_expiry)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if deleted == 1 {
            Ok(())
        } else {
            Err(IdempotencyError::InconsistentState {
                key: key.to_string(),
                reason: "処理中スロットが既に解放または再取得されています".to_string(),
            })
        }
    }
}

fn map_redis_error(err: RedisError) -> IdempotencyError {
    IdempotencyError::Persistence(err.to_string())
}

/// Helper function to format record keys (exposed for testing without Redis connection).
pub fn format_record_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}
