//! HTTP error mapping for the JWKS server.
//!
//! The HTTP surface here is narrow — two read-only discovery routes — so
//! there is exactly one failure mode worth distinguishing to a caller: the
//! backend couldn't be read.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use pipeline_idp_core::Error as CoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// The signing key manager or storage backend failed to serve the
    /// keyset or discovery document.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self::Internal(err.to_string())
    }
}
