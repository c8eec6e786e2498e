use axum::{
    extract::rejection::BytesRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use htunnel_core::TunnelError;
use serde::Serialize;

/// JSON body of every error reply.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl From<TunnelError> for ApiError {
    fn from(e: TunnelError) -> Self {
        let message = e.to_string();
        match e {
            TunnelError::SessionNotFound(_) => Self::not_found("session_not_found", message),
            TunnelError::SessionExists(_) => Self::conflict("session_running", message),
            TunnelError::StaleSequence { .. } => Self::conflict("stale_sequence", message),
            TunnelError::SequenceWindow { .. } => {
                Self::conflict("sequence_out_of_window", message)
            }
            TunnelError::SessionLimit(_) => Self::unavailable("session_limit", message),
            TunnelError::Codec(_) | TunnelError::InvalidMessage(_) => {
                Self::bad_request("malformed_request", message)
            }
            TunnelError::Config(_) | TunnelError::Io(_) | TunnelError::Other(_) => {
                tracing::error!(error = %message, "internal error");
                Self::internal("internal_error", message)
            }
        }
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        let status = rejection.status();
        let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
            "payload_too_large"
        } else {
            "malformed_request"
        };
        Self::new(status, code, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
