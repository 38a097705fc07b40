use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{IdempotencyError, Result};
use crate::record::DataRecord;

/// バックエンドストアに対する CRUD 契約。
///
/// `put_record` の条件付き作成が、プロセスをまたぐ唯一の協調点になる。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// レコードを取得する（存在しなければ Err(NotFound)）。
    ///
    /// 有効期限の判定は呼び出し側で行う。
    async fn get_record(&self, key: &str) -> Result<DataRecord>;

    /// 条件付きで新規作成する。
    ///
    /// `now` 時点で有効期限内のレコードが既にあれば、原子的に Err(AlreadyExists) を返す。
    /// 期限切れのレコードは置き換える。
    async fn put_record(&self, record: &DataRecord, now: DateTime<Utc>) -> Result<()>;

    /// レコードを上書きする。
    ///
    /// `fence` が `Some(expiry)` の場合、保存済みレコードが同じ有効期限の
    /// IN_PROGRESS であるときのみ書き込み、そうでなければ Err(InconsistentState) を返す。
    async fn update_record(&self, record: &DataRecord, fence: Option<i64>) -> Result<()>;

    /// レコードを削除する。
    ///
    /// `fence` が None の場合は無条件に削除し、存在しなくてもエラーにしない。
    /// `Some(expiry)` の場合、保存済みレコードが同じ有効期限の IN_PROGRESS で
    /// あるときのみ削除し、そうでなければ Err(InconsistentState) を返す。
    async fn delete_record(&self, key: &str, fence: Option<i64>) -> Result<()>;
}

/// リモートバックエンドのテーブル名・フィールド名の対応付け。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAttributes {
    /// テーブル名（Postgres）またはキープレフィックス（Redis）。
    pub table: String,
    pub key_attr: String,
    pub status_attr: String,
    pub expiry_attr: String,
    pub data_attr: String,
    pub validation_attr: String,
}

impl Default for RecordAttributes {
    fn default() -> Self {
        Self {
            table: "idempotency".to_string(),
            key_attr: "id".to_string(),
            status_attr: "status".to_string(),
            expiry_attr: "expiration".to_string(),
            data_attr: "data".to_string(),
            validation_attr: "validation".to_string(),
        }
    }
}

impl RecordAttributes {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// SQL やスクリプトに埋め込むため、すべての名前が識別子として安全か検証する。
    pub fn validate(&self) -> Result<()> {
        let names = [
            ("table", &self.table),
            ("key_attr", &self.key_attr),
            ("status_attr", &self.status_attr),
            ("expiry_attr", &self.expiry_attr),
            ("data_attr", &self.data_attr),
            ("validation_attr", &self.validation_attr),
        ];
        for (field, name) in names {
            if !is_identifier(name) {
                return Err(IdempotencyError::Config(format!(
                    "{} は識別子として不正です: {:?}",
                    field, name
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
