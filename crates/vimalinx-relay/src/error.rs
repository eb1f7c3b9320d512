//! API error taxonomy.
//!
//! Every handler failure maps to one of these variants; each carries a
//! human-readable message and renders as a structured JSON body with the
//! matching HTTP status. No failure is allowed to crash the process.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or missing fields (400).
    #[error("{0}")]
    InvalidInput(String),
    /// Bad or missing credentials or signature (401).
    #[error("{0}")]
    Unauthorized(String),
    /// Invite required, registration disabled, or IP not allowed (403).
    #[error("{0}")]
    Forbidden(String),
    /// Unknown user, machine, or chat owner (404).
    #[error("{0}")]
    NotFound(String),
    /// Duplicate id (409).
    #[error("{0}")]
    Conflict(String),
    /// Body exceeds the resolved payload limit (413).
    #[error("{0}")]
    PayloadTooLarge(String),
    /// Rate limit exceeded (429).
    #[error("{0}")]
    TooManyRequests(String),
    /// Reused nonce within the freshness window (409).
    #[error("{0}")]
    ReplayDetected(String),
    /// Webhook forward to a gateway failed (502).
    #[error("{0}")]
    UpstreamFailure(String),
    /// Target device key has no derivable session (503).
    #[error("{0}")]
    Unavailable(String),
    /// Synchronous persistence or other internal failure (500).
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) | ApiError::ReplayDetected(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, part of the wire contract.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::PayloadTooLarge(_) => "payload_too_large",
            ApiError::TooManyRequests(_) => "too_many_requests",
            ApiError::ReplayDetected(_) => "replay_detected",
            ApiError::UpstreamFailure(_) => "upstream_failure",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ReplayDetected("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::TooManyRequests("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::ReplayDetected("x".into()).code(), "replay_detected");
        assert_eq!(ApiError::UpstreamFailure("x".into()).code(), "upstream_failure");
    }
}
