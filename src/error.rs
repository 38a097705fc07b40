use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// キー抽出パスが指定されているが、ドキュメントに該当する値がない。
    #[error("冪等キーが見つかりません: path={path}")]
    KeyError { path: String },
    /// 有効期限内のレコードが既に存在する（別の呼び出しが処理中または処理済み）。
    #[error("冪等レコードが既に存在します: key={key}")]
    AlreadyExists { key: String },
    /// 同一キーに対してペイロードのハッシュが一致しない。
    #[error("ペイロードの検証に失敗しました: key={key}")]
    ValidationError { key: String },
    #[error("レコードが見つかりません: key={key}")]
    NotFound { key: String },
    #[error("レコードの状態が不正です: key={key}, reason={reason}")]
    InconsistentState { key: String, reason: String },
    #[error("永続化エラー: {0}")]
    Persistence(String),
    #[error("シリアライズエラー: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("設定エラー: {0}")]
    Config(String),
}

impl IdempotencyError {
    /// 重複呼び出しを示すエラーかどうか。
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// ラップ対象の処理自体のエラーと、冪等制御のエラーを区別する。
#[derive(Debug, Error)]
pub enum HandlerError<E> {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error("ハンドラーエラー: {0}")]
    Handler(E),
}
