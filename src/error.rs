// Error handling module
// Defines error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::RefreshError;

/// Errors surfaced by the authenticated request path
#[derive(Error, Debug)]
pub enum ApiError {
    /// No credential stored; the user has to log in
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Credential could not be refreshed; the user has to log in again
    #[error("Session expired: {0}")]
    SessionExpired(#[from] RefreshError),

    /// Error response from the backend API
    #[error("Backend API error: {status} - {message}")]
    Backend { status: u16, message: String },

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Whether the caller should send the user back to the login page
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::NotAuthenticated | ApiError::SessionExpired(_))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotAuthenticated => (
                StatusCode::UNAUTHORIZED,
                "not_authenticated",
                "Not authenticated".to_string(),
            ),
            ApiError::SessionExpired(err) => {
                tracing::warn!("Session expired: {}", err);
                (
                    StatusCode::UNAUTHORIZED,
                    "session_expired",
                    "Session expired, please log in again".to_string(),
                )
            }
            ApiError::Backend { status, message } => {
                let status_code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status_code, "backend_error", message)
            }
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
