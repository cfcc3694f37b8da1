//! Parse-style API errors for the full server.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::error::SipGuardError;

/// Parse error codes used by the device SDK.
pub mod code {
    pub const INVALID_LOGIN: u16 = 101;
    pub const INVALID_REQUEST: u16 = 202;
    pub const EMAIL_TAKEN: u16 = 203;
    pub const LOGIN_REQUIRED: u16 = 206;
    pub const NO_PERMISSION: u16 = 209;
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid host")]
    InvalidHost,

    #[error("invalid json")]
    InvalidJson,

    /// Any request the server understood but refuses (bad field, bad filter).
    #[error("{0}")]
    Invalid(String),

    #[error("does not exist")]
    DoesNotExist,

    #[error("no permission")]
    NoPermission,

    #[error("login required")]
    LoginRequired,

    #[error("invalid username/password.")]
    InvalidLogin,

    #[error("{message}")]
    Conflict { code: u16, message: String },

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError::Invalid(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidLogin => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Parse error code, if the device SDK expects one.
    pub fn code(&self) -> Option<u16> {
        match self {
            ApiError::InvalidJson | ApiError::Invalid(_) | ApiError::DoesNotExist => {
                Some(code::INVALID_REQUEST)
            }
            ApiError::NoPermission => Some(code::NO_PERMISSION),
            ApiError::LoginRequired => Some(code::LOGIN_REQUIRED),
            ApiError::InvalidLogin => Some(code::INVALID_LOGIN),
            ApiError::Conflict { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                error!("Internal error: {}", detail);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = match self.code() {
            Some(code) => serde_json::json!({"code": code, "error": message}),
            None => serde_json::json!({"error": message}),
        };
        (status, Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Internal(format!("database: {}", e))
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(e: r2d2::Error) -> Self {
        ApiError::Internal(format!("pool: {}", e))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Internal(format!("json: {}", e))
    }
}

impl From<SipGuardError> for ApiError {
    fn from(e: SipGuardError) -> Self {
        ApiError::Internal(e.to_string())
    }
}
