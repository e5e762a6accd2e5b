//! JSON error responses.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::error::BrokerError;

/// Error body: `{"error": "...", "code": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Unauthorized")
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Validation(msg) => Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            BrokerError::NotFound(what) => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found"))
            }
            BrokerError::Conflict(msg) => Self::new(StatusCode::CONFLICT, "CONFLICT", msg),
            BrokerError::AllocationExhausted => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "TUNNEL_POOL_EXHAUSTED",
                "No tunnel ports available",
            ),
            BrokerError::TokenExpired => {
                Self::new(StatusCode::GONE, "TOKEN_EXPIRED", "Enrollment token expired")
            }
            BrokerError::TokenAlreadyUsed => Self::new(
                StatusCode::CONFLICT,
                "TOKEN_ALREADY_USED",
                "Enrollment token already used",
            ),
            BrokerError::Unauthorized => Self::unauthorized(),
            BrokerError::Payload(e) => {
                error!(error = %e, "Update payload unavailable");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PAYLOAD_ERROR",
                    "Update payload unavailable",
                )
            }
            BrokerError::Storage(e) => {
                error!(error = %e, "Storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "Internal error",
                )
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            rejection.body_text(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
