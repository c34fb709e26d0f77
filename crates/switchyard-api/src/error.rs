//! エラー型定義 (switchyard-api)

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// switchyard-api のエラー型
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] switchyard_core::Error),
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, ApiError>;

/// Wire shape of every error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: &'static str,
}

impl ApiError {
    /// HTTP status for this failure. The interesting rows are the routing
    /// taxonomy: admission, ownership, and dispatch failures each carry a
    /// distinct status so callers can react without parsing messages.
    pub fn status_code(&self) -> StatusCode {
        use switchyard_core::Error as Core;
        match self {
            ApiError::InvalidRequest(_) | ApiError::Json(_) => StatusCode::BAD_REQUEST,
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Core(core) => match core {
                Core::DuplicateName(_) | Core::Conflict(_) | Core::StillOwned(_, _) => {
                    StatusCode::CONFLICT
                }
                Core::AgentNotFound(_) | Core::SessionNotFound(_) => StatusCode::NOT_FOUND,
                Core::NoCapableAgent(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Core::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
                Core::DispatchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                Core::DispatchFailed(_, _) => StatusCode::BAD_GATEWAY,
                Core::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                Core::Json(_) | Core::Config(_) => StatusCode::BAD_REQUEST,
                Core::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse {
            error: self.to_string(),
            status: "error",
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::Error as Core;

    #[test]
    fn test_routing_failures_map_to_distinct_statuses() {
        let cases = [
            (
                Core::DuplicateName("checker".into()),
                StatusCode::CONFLICT,
            ),
            (Core::SessionNotFound("s-1".into()), StatusCode::NOT_FOUND),
            (Core::Conflict("s-1".into()), StatusCode::CONFLICT),
            (
                Core::StillOwned("s-1".into(), "sup-2".into()),
                StatusCode::CONFLICT,
            ),
            (
                Core::NoCapableAgent("event-create".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (Core::CapacityExceeded(50), StatusCode::TOO_MANY_REQUESTS),
            (
                Core::StoreUnavailable("disk full".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Core::DispatchTimeout("checker".into()),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                Core::DispatchFailed("checker".into(), "boom".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (core, expected) in cases {
            assert_eq!(ApiError::from(core).status_code(), expected);
        }
    }

    #[test]
    fn test_invalid_request_is_bad_request() {
        let err = ApiError::InvalidRequest("message must not be empty".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
