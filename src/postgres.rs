//! PostgresPersistenceStore: sqlx を使用した PersistenceStore 実装。
//! feature = "postgres" で有効化される。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{IdempotencyError, Result};
use crate::record::{DataRecord, DataRecordStatus};
use crate::store::{PersistenceStore, RecordAttributes};

/// PostgreSQL を使った冪等レコードストア。
///
/// 条件付き作成は `INSERT ... ON CONFLICT DO UPDATE ... WHERE 既存の有効期限 < now`
/// で行い、更新行数 0 を競合として扱う。
#[derive(Clone)]
pub struct PostgresPersistenceStore {
    pool: PgPool,
    statements: Statements,
}

impl PostgresPersistenceStore {
    pub fn new(pool: PgPool, attributes: RecordAttributes) -> Result<Self> {
        attributes.validate()?;
        Ok(Self {
            pool,
            statements: Statements::new(&attributes),
        })
    }

    /// テーブルが無ければ作成する。
    pub async fn ensure_table(&self) -> Result<()> {
        sqlx::query(&self.statements.create_table)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// 属性名から組み立てた SQL 文。
#[derive(Debug, Clone)]
pub struct Statements {
    pub create_table: String,
    pub select: String,
    pub conditional_insert: String,
    pub upsert: String,
    pub fenced_update: String,
    pub delete: String,
    pub fenced_delete: String,
}

impl Statements {
    pub fn new(attrs: &RecordAttributes) -> Self {
        let RecordAttributes {
            table,
            key_attr: k,
            status_attr: s,
            expiry_attr: e,
            data_attr: d,
            validation_attr: v,
        } = attrs;
        let insert = format!(
            "INSERT INTO {table} AS existing ({k}, {s}, {e}, {d}, {v}) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT ({k}) DO UPDATE SET \
             {s} = EXCLUDED.{s}, {e} = EXCLUDED.{e}, {d} = EXCLUDED.{d}, {v} = EXCLUDED.{v}"
        );
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 {k} TEXT PRIMARY KEY, \
                 {s} TEXT NOT NULL, \
                 {e} BIGINT NOT NULL, \
                 {d} TEXT, \
                 {v} TEXT NOT NULL DEFAULT '')"
            ),
            select: format!("SELECT {s}, {e}, {d}, {v} FROM {table} WHERE {k} = $1"),
            conditional_insert: format!("{insert} WHERE existing.{e} < $6"),
            upsert: insert,
            fenced_update: format!(
                "UPDATE {table} SET {s} = $2, {e} = $3, {d} = $4, {v} = $5 \
                 WHERE {k} = $1 AND {s} = 'IN_PROGRESS' AND {e} = $6"
            ),
            delete: format!("DELETE FROM {table} WHERE {k} = $1"),
            fenced_delete: format!(
                "DELETE FROM {table} WHERE {k} = $1 AND {s} = 'IN_PROGRESS' AND {e} = $2"
            ),
        }
    }
}

#[async_trait]
impl PersistenceStore for PostgresPersistenceStore {
    async fn get_record(&self, key: &str) -> Result<DataRecord> {
        let row: Option<(String, i64, Option<String>, String)> =
            sqlx::query_as(&self.statements.select)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let (status, expiry, data, validation) = row.ok_or_else(|| IdempotencyError::NotFound {
            key: key.to_string(),
        })?;
        DataRecord::from_parts(
            key.to_string(),
            DataRecordStatus::parse(&status)?,
            expiry,
            data,
            validation,
        )
    }

    async fn put_record(&self, record: &DataRecord, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(&self.statements.conditional_insert)
            .bind(&record.idempotency_key)
            .bind(record.stored_status().as_str())
            .bind(record.expiry_timestamp)
            .bind(&record.response_data)
            .bind(&record.payload_hash)
            .bind(now.timestamp())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::AlreadyExists {
                key: record.idempotency_key.clone(),
            });
        }
        Ok(())
    }

    async fn update_record(&self, record: &DataRecord, fence: Option<i64>) -> Result<()> {
        let statement = match fence {
            Some(_) => &self.statements.fenced_update,
            None => &self.statements.upsert,
        };
        let mut query = sqlx::query(statement)
            .bind(&record.idempotency_key)
            .bind(record.stored_status().as_str())
            .bind(record.expiry_timestamp)
            .bind(&record.response_data)
            .bind(&record.payload_hash);
        if let Some(expected_expiry) = fence {
            query = query.bind(expected_expiry);
        }
        let result = query.execute(&self.pool).await.map_err(map_sqlx_error)?;

        if fence.is_some() && result.rows_affected() == 0 {
            return Err(IdempotencyError::InconsistentState {
                key: record.idempotency_key.clone(),
                reason: "処理中スロットが既に解放または再取得されています".to_string(),
            });
        }
        Ok(())
    }

    async fn delete_record(&self, key: &str, fence: Option<i64>) -> Result<()> {
        let query = match fence {
            Some(expected_expiry) => sqlx::query(&self.statements.fenced_delete)
                .bind(key)
                .bind(expected_expiry),
            None => sqlx::query(&self.statements.delete).bind(key),
        };
        let result = query.execute(&self.pool).await.map_err(map_sqlx_error)?;

        if fence.is_some() && result.rows_affected() == 0 {
            return Err(IdempotencyError::InconsistentState {
                key: key.to_string(),
                reason: "処理中スロットが既に解放または再取得されています".to_string(),
            });
        }
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> IdempotencyError {
    IdempotencyError::Persistence(err.to_string())
}
