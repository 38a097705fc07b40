use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IdempotencyError, Result};

/// 冪等レコードのステータス。
///
/// `Expired` は永続化されず、読み出し時に有効期限から導出される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataRecordStatus {
    InProgress,
    Completed,
    Expired,
}

impl DataRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(IdempotencyError::Persistence(format!(
                "不明なステータスです: {}",
                other
            ))),
        }
    }
}

/// 永続化される冪等状態の単位。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub idempotency_key: String,
    status: DataRecordStatus,
    /// エポック秒。
    pub expiry_timestamp: i64,
    pub response_data: Option<String>,
    /// 空文字はペイロード検証無効を表す。
    pub payload_hash: String,
}

impl DataRecord {
    /// 処理中レコードを作成する。
    pub fn in_progress(
        idempotency_key: impl Into<String>,
        expiry_timestamp: i64,
        payload_hash: impl Into<String>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: DataRecordStatus::InProgress,
            expiry_timestamp,
            response_data: None,
            payload_hash: payload_hash.into(),
        }
    }

    /// 処理済みレコードを作成する。
    pub fn completed(
        idempotency_key: impl Into<String>,
        expiry_timestamp: i64,
        response_data: impl Into<String>,
        payload_hash: impl Into<String>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: DataRecordStatus::Completed,
            expiry_timestamp,
            response_data: Some(response_data.into()),
            payload_hash: payload_hash.into(),
        }
    }

    /// ストアから読み出した値を検証してレコードを組み立てる。
    ///
    /// `response_data` の有無は `COMPLETED` と厳密に対応しなければならない。
    pub fn from_parts(
        idempotency_key: String,
        status: DataRecordStatus,
        expiry_timestamp: i64,
        response_data: Option<String>,
        payload_hash: String,
    ) -> Result<Self> {
        let consistent = match status {
            DataRecordStatus::Completed => response_data.is_some(),
            DataRecordStatus::InProgress => response_data.is_none(),
            DataRecordStatus::Expired => false,
        };
        if !consistent {
            return Err(IdempotencyError::InconsistentState {
                key: idempotency_key,
                reason: format!(
                    "status={} と response_data の有無が一致しません",
                    status.as_str()
                ),
            });
        }
        Ok(Self {
            idempotency_key,
            status,
            expiry_timestamp,
            response_data,
            payload_hash,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expiry_timestamp
    }

    /// 有効期限を過ぎていれば、永続化されたステータスに関わらず `Expired` を返す。
    pub fn status(&self, now: DateTime<Utc>) -> DataRecordStatus {
        if self.is_expired(now) {
            DataRecordStatus::Expired
        } else {
            self.status
        }
    }

    /// 永続化用のステータス。`Expired` になることはない。
    pub fn stored_status(&self) -> DataRecordStatus {
        self.status
    }
}
