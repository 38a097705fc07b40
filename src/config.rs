use std::time::Duration;

use serde::Deserialize;

use crate::error::{IdempotencyError, Result};

/// LocalCacheCapacity の既定値。
pub const DEFAULT_LOCAL_CACHE_CAPACITY: usize = 256;
/// 既定の有効期限（1 時間）。
pub const DEFAULT_EXPIRATION_SECS: u64 = 3600;

/// コーディネーターの設定。
///
/// YAML から読み込む場合、未指定のフィールドは既定値になる。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// 冪等キーの抽出パス。None の場合はドキュメント全体をハッシュする。
    pub event_key_path: Option<String>,
    /// ペイロード検証の抽出パス。None の場合は検証しない。
    pub payload_validation_path: Option<String>,
    pub fail_on_missing_key: bool,
    pub use_local_cache: bool,
    pub local_cache_capacity: usize,
    /// COMPLETED レコードの有効期限（秒）。
    pub expiration_secs: u64,
    /// IN_PROGRESS レコードの有効期限（秒）。None の場合は expiration_secs と同じ。
    pub in_progress_expiration_secs: Option<u64>,
    /// 操作名に付与するサブスコープ。
    pub scope: Option<String>,
    /// 処理成功後に結果の記録が失敗した場合、処理中スロットを解放するかどうか。
    ///
    /// false（既定）の場合スロットは IN_PROGRESS のまま残り、処理中有効期限まで
    /// 同じキーの呼び出しを拒否する。true の場合は即座に再試行できるが、
    /// 成功済みの処理が再実行されうる。
    pub release_on_completion_failure: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            event_key_path: None,
            payload_validation_path: None,
            fail_on_missing_key: false,
            use_local_cache: false,
            local_cache_capacity: DEFAULT_LOCAL_CACHE_CAPACITY,
            expiration_secs: DEFAULT_EXPIRATION_SECS,
            in_progress_expiration_secs: None,
            scope: None,
            release_on_completion_failure: false,
        }
    }
}

impl IdempotencyConfig {
    pub fn with_event_key_path(mut self, path: impl Into<String>) -> Self {
        self.event_key_path = Some(path.into());
        self
    }

    pub fn with_payload_validation_path(mut self, path: impl Into<String>) -> Self {
        self.payload_validation_path = Some(path.into());
        self
    }

    pub fn with_fail_on_missing_key(mut self, fail: bool) -> Self {
        self.fail_on_missing_key = fail;
        self
    }

    pub fn with_local_cache(mut self, capacity: usize) -> Self {
        self.use_local_cache = true;
        self.local_cache_capacity = capacity;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration_secs = expiration.as_secs();
        self
    }

    pub fn with_in_progress_expiration(mut self, expiration: Duration) -> Self {
        self.in_progress_expiration_secs = Some(expiration.as_secs());
        self
    }

    pub fn with_release_on_completion_failure(mut self, release: bool) -> Self {
        self.release_on_completion_failure = release;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn in_progress_expiration(&self) -> Duration {
        Duration::from_secs(
            self.in_progress_expiration_secs
                .unwrap_or(self.expiration_secs),
        )
    }

    /// 設定値のバリデーション。
    pub fn validate(&self) -> Result<()> {
        if self.expiration_secs == 0 {
            return Err(IdempotencyError::Config(
                "expiration_secs must be > 0".into(),
            ));
        }
        if self.in_progress_expiration_secs == Some(0) {
            return Err(IdempotencyError::Config(
                "in_progress_expiration_secs must be > 0".into(),
            ));
        }
        if self.use_local_cache && self.local_cache_capacity == 0 {
            return Err(IdempotencyError::Config(
                "local_cache_capacity must be > 0 when use_local_cache is enabled".into(),
            ));
        }
        for (name, path) in [
            ("event_key_path", &self.event_key_path),
            ("payload_validation_path", &self.payload_validation_path),
        ] {
            if path.as_deref().is_some_and(|p| p.trim().is_empty()) {
                return Err(IdempotencyError::Config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }

    /// YAML 文字列から読み込み、バリデーションする。
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| IdempotencyError::Config(format!("failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// YAML ファイルから読み込む。
    pub fn load(path: &str) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| IdempotencyError::Config(format!("failed to read file: {}", e)))?;
        Self::from_yaml_str(&yaml)
    }
}
