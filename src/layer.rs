use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::coordinator::IdempotencyCoordinator;
use crate::error::IdempotencyError;
use crate::record::{DataRecord, DataRecordStatus};

/// Idempotency-Key ヘッダー名
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
/// リプレイされたレスポンスに付与するヘッダー名
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

/// 記録されるレスポンス。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub status: u16,
    pub body: String,
}

/// axum middleware State に渡すコーディネーター + 設定
#[derive(Clone)]
pub struct IdempotencyState {
    pub coordinator: Arc<IdempotencyCoordinator>,
    /// ヘッダー名（デフォルト: "idempotency-key"）
    pub header_name: String,
}

impl IdempotencyState {
    pub fn new(coordinator: Arc<IdempotencyCoordinator>) -> Self {
        Self {
            coordinator,
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
        }
    }

    pub fn with_header_name(mut self, header_name: impl Into<String>) -> Self {
        self.header_name = header_name.into();
        self
    }
}

/// リクエストからコーディネーターに渡すドキュメントを組み立てる。
///
/// `{"method", "path", "idempotency_key", "body"}` の形になる。
/// body が JSON として解釈できない場合は文字列として格納する。
pub fn request_document(method: &str, path: &str, idempotency_key: &str, body: &[u8]) -> Value {
    let body = serde_json::from_slice::<Value>(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
    json!({
        "method": method,
        "path": path,
        "idempotency_key": idempotency_key,
        "body": body,
    })
}

/// axum ミドルウェア関数
///
/// `axum::middleware::from_fn_with_state` で利用する。
/// Idempotency-Key ヘッダーの無いリクエストはそのまま通す。
///
/// ```ignore
/// use axum::{Router, middleware};
/// use k1s0_idempotency_coordinator::{idempotency_middleware, IdempotencyState};
///
/// let state = IdempotencyState::new(coordinator);
/// let app = Router::new()
///     .route("/create", post(handler))
///     .layer(middleware::from_fn_with_state(state, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let idempotency_key = req
        .headers()
        .get(&state.header_name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let key = match idempotency_key {
        Some(k) => k,
        None => return next.run(req).await,
    };

    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return (StatusCode::BAD_REQUEST, "リクエストボディを読み取れません").into_response(),
    };
    let document = request_document(parts.method.as_str(), parts.uri.path(), &key, &body_bytes);
    let coordinator = &state.coordinator;

    let slot = match coordinator.save_in_progress(&document, Utc::now()).await {
        Ok(slot) => slot,
        Err(IdempotencyError::AlreadyExists { .. }) => {
            return match coordinator.get_record(&document, Utc::now()).await {
                Ok(Some(record)) => replay(record),
                // 競合直後に解放された。クライアントの再試行に任せる
                Ok(None) => (StatusCode::CONFLICT, "リクエストは現在処理中です").into_response(),
                Err(e) => error_response(e),
            };
        }
        Err(e) => return error_response(e),
    };

    // ハンドラー実行
    let response = next
        .run(Request::from_parts(parts, Body::from(body_bytes)))
        .await;

    // レスポンスを読み取ってストアに保存
    let (parts, body) = response.into_parts();
    let resp_bytes: Bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            release(coordinator, &slot, &"レスポンスボディを読み取れません").await;
            return Response::from_parts(parts, Body::empty());
        }
    };

    if parts.status.is_success() {
        let recorded = RecordedResponse {
            status: parts.status.as_u16(),
            body: String::from_utf8_lossy(&resp_bytes).to_string(),
        };
        if let Err(e) = coordinator
            .complete_in_progress(&slot, &recorded, Utc::now())
            .await
        {
            tracing::error!(key = %slot.idempotency_key, error = %e, "failed to record idempotent response");
            if coordinator.config().release_on_completion_failure {
                release(coordinator, &slot, &e).await;
            }
        }
    } else {
        let cause = format!("status {}", parts.status.as_u16());
        release(coordinator, &slot, &cause).await;
    }

    Response::from_parts(parts, Body::from(resp_bytes))
}

async fn release(
    coordinator: &IdempotencyCoordinator,
    slot: &DataRecord,
    cause: &(dyn std::fmt::Display + Sync),
) {
    if let Err(e) = coordinator.release_in_progress(slot, cause).await {
        tracing::warn!(key = %slot.idempotency_key, error = %e, "failed to release in-progress slot");
    }
}

fn replay(record: DataRecord) -> Response {
    if record.stored_status() != DataRecordStatus::Completed {
        return (StatusCode::CONFLICT, "リクエストは現在処理中です").into_response();
    }
    let recorded = match record
        .response_data
        .as_deref()
        .map(serde_json::from_str::<RecordedResponse>)
    {
        Some(Ok(recorded)) => recorded,
        _ => {
            tracing::warn!(key = %record.idempotency_key, "recorded response is unreadable");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let status_code = StatusCode::from_u16(recorded.status).unwrap_or(StatusCode::OK);
    (status_code, [(REPLAYED_HEADER, "true")], recorded.body).into_response()
}

fn error_response(err: IdempotencyError) -> Response {
    let status = match &err {
        IdempotencyError::KeyError { .. } | IdempotencyError::Config(_) => StatusCode::BAD_REQUEST,
        IdempotencyError::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        IdempotencyError::AlreadyExists { .. } => StatusCode::CONFLICT,
        _ => {
            tracing::warn!(error = %err, "idempotency store error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string()).into_response()
}
