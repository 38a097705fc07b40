use std::sync::Arc;

use serde_json::Value;

use crate::error::{IdempotencyError, Result};
use crate::extractor::{is_missing, JsonPathExtractor, KeyExtractor};
use crate::hash::generate_hash;

/// スコープとサブスコープの区切り文字。
pub const SCOPE_SEPARATOR: &str = ".";
/// スコープとハッシュの区切り文字。
pub const KEY_SEPARATOR: &str = "#";

/// スコープ名とハッシュ化したキー素材から冪等キーを組み立てる。
#[derive(Clone)]
pub struct KeyBuilder {
    scope: String,
    event_key_path: Option<String>,
    payload_validation_path: Option<String>,
    fail_on_missing_key: bool,
    extractor: Arc<dyn KeyExtractor>,
}

impl std::fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBuilder")
            .field("scope", &self.scope)
            .field("event_key_path", &self.event_key_path)
            .field("payload_validation_path", &self.payload_validation_path)
            .field("fail_on_missing_key", &self.fail_on_missing_key)
            .finish()
    }
}

impl KeyBuilder {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            event_key_path: None,
            payload_validation_path: None,
            fail_on_missing_key: false,
            extractor: Arc::new(JsonPathExtractor),
        }
    }

    /// サブスコープを付与する（`{scope}.{sub_scope}`）。
    pub fn with_sub_scope(mut self, sub_scope: Option<&str>) -> Self {
        if let Some(sub) = sub_scope.filter(|s| !s.is_empty()) {
            self.scope = format!("{}{}{}", self.scope, SCOPE_SEPARATOR, sub);
        }
        self
    }

    pub fn with_event_key_path(mut self, path: Option<String>) -> Self {
        self.event_key_path = path;
        self
    }

    pub fn with_payload_validation_path(mut self, path: Option<String>) -> Self {
        self.payload_validation_path = path;
        self
    }

    pub fn with_fail_on_missing_key(mut self, fail: bool) -> Self {
        self.fail_on_missing_key = fail;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn validation_enabled(&self) -> bool {
        self.payload_validation_path.is_some()
    }

    /// `(idempotency_key, validation_hash)` を返す。
    pub fn build(&self, document: &Value) -> Result<(String, String)> {
        Ok((self.idempotency_key(document)?, self.validation_hash(document)?))
    }

    pub fn idempotency_key(&self, document: &Value) -> Result<String> {
        let hash = match &self.event_key_path {
            Some(path) => {
                let material = self.extractor.extract(document, path)?;
                if self.fail_on_missing_key && is_missing(material.as_ref()) {
                    return Err(IdempotencyError::KeyError { path: path.clone() });
                }
                match material {
                    Some(value) => generate_hash(&value),
                    None => {
                        tracing::warn!(
                            path = %path,
                            scope = %self.scope,
                            "idempotency key not found in document, hashing whole document"
                        );
                        generate_hash(document)
                    }
                }
            }
            None => generate_hash(document),
        };
        Ok(format!("{}{}{}", self.scope, KEY_SEPARATOR, hash))
    }

    /// 検証パス未設定時は空文字を返す。
    pub fn validation_hash(&self, document: &Value) -> Result<String> {
        match &self.payload_validation_path {
            Some(path) => {
                let material = self
                    .extractor
                    .extract(document, path)?
                    .unwrap_or(Value::Null);
                Ok(generate_hash(&material))
            }
            None => Ok(String::new()),
        }
    }
}
