use crate::application::LendingError;
use crate::domain::{ScanError, ScheduleError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::types::ErrorResponse;

/// API層のエラー型
///
/// アプリケーション層のエラーをラップし、HTTPレスポンスへのマッピングを提供する。
#[derive(Debug)]
pub struct ApiError(pub LendingError);

impl From<LendingError> for ApiError {
    fn from(err: LendingError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, error_type) = match &self.0 {
            // 401 Unauthorized - 認証ゲートウェイからの利用者情報がない
            LendingError::NotSignedIn => (StatusCode::UNAUTHORIZED, "NOT_SIGNED_IN"),

            // 404 Not Found - リクエストされたリソースが存在しない
            LendingError::RequestNotFound => (StatusCode::NOT_FOUND, "REQUEST_NOT_FOUND"),
            LendingError::ScheduleNotFound => (StatusCode::NOT_FOUND, "SCHEDULE_NOT_FOUND"),
            LendingError::ItemNotFound => (StatusCode::NOT_FOUND, "ITEM_NOT_FOUND"),

            // 403 Forbidden - 当事者だが役割が違う
            LendingError::Schedule(ScheduleError::NotPermitted { .. })
            | LendingError::Scan(ScanError::WrongRole { .. }) => {
                (StatusCode::FORBIDDEN, "WRONG_ROLE")
            }

            // 409 Conflict - 現在の状態と衝突する
            LendingError::DuplicateActiveRequest => {
                (StatusCode::CONFLICT, "DUPLICATE_ACTIVE_REQUEST")
            }
            LendingError::Unresolved => (StatusCode::CONFLICT, "REFRESH_AND_RETRY"),

            // 422 Unprocessable Entity - ビジネスルール違反
            LendingError::Scan(ScanError::Mismatch(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "SCAN_MISMATCH")
            }
            LendingError::Scan(_) => (StatusCode::UNPROCESSABLE_ENTITY, "SCAN_NOT_READY"),
            LendingError::OwnItem => (StatusCode::UNPROCESSABLE_ENTITY, "OWN_ITEM"),
            LendingError::ItemUnavailable => {
                (StatusCode::UNPROCESSABLE_ENTITY, "ITEM_UNAVAILABLE")
            }
            LendingError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            LendingError::Transition(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_TRANSITION")
            }
            LendingError::Schedule(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_SCHEDULE"),
            LendingError::Rating(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_RATING"),

            // 502 Bad Gateway - 永続化層の障害
            // 詳細はログに記録し、クライアントには利用者向けのメッセージのみを返す
            LendingError::Remote { source, .. } => {
                tracing::error!("Table store error: {}", source);
                (StatusCode::BAD_GATEWAY, "REMOTE_ERROR")
            }
        };

        let body = Json(ErrorResponse::new(error_type, message));
        (status, body).into_response()
    }
}
