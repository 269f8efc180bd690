//! Mapping of telephony errors onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::{ErrorKind, TelephonyError};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Error returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    /// No or unknown request credentials
    Unauthenticated,
    /// Malformed request body or query
    BadRequest(String),
    Telephony(TelephonyError),
}

impl From<TelephonyError> for ApiError {
    fn from(err: TelephonyError) -> Self {
        ApiError::Telephony(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Telephony(err.into())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Conflict | ErrorKind::InvalidTransition => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::DuplicateEvent => StatusCode::OK,
        ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    kind: "unauthenticated".into(),
                    message: "missing or unknown credentials".into(),
                },
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    kind: "bad_request".into(),
                    message,
                },
            ),
            ApiError::Telephony(err) => {
                let kind = err.kind();
                let status = status_for(kind);
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                }
                let kind = serde_json::to_value(kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "internal".into());
                let message = match &err {
                    // Do not leak database details to clients
                    TelephonyError::Database(_) => "internal error".to_string(),
                    other => other.to_string(),
                };
                (status, ErrorBody { kind, message })
            }
        };
        (status, Json(body)).into_response()
    }
}
