//! HTTP error responses.
//!
//! Every failure is answered as `{"status": "error", "code": ..., "error": ...}`
//! with a status code derived from the [`ErrorCode`].

use crate::error::SyncError;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error categories on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Record lacks its issue number.
    MissingIdentity,
    /// Malformed body, query, client id, table or filter.
    InvalidInput,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    SubscriptionNotFound,
    /// Backing store failed.
    StoreUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingIdentity | ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound | ErrorCode::SubscriptionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::StoreUnavailable | ErrorCode::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Serialized form of an [`ApiError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub code: ErrorCode,
    pub error: String,
}

impl ErrorBody {
    /// Rebuild the library error on the client side.
    pub fn into_sync_error(self) -> SyncError {
        match self.code {
            ErrorCode::MissingIdentity => SyncError::MissingIdentity,
            ErrorCode::InvalidInput => SyncError::InvalidRequest(self.error),
            ErrorCode::NotFound => SyncError::NotFound(self.error),
            ErrorCode::AlreadyExists => SyncError::AlreadyExists(self.error),
            ErrorCode::PermissionDenied => SyncError::PermissionDenied(self.error),
            ErrorCode::SubscriptionNotFound => SyncError::InvalidRequest(self.error),
            ErrorCode::StoreUnavailable => SyncError::StoreUnavailable(self.error),
            ErrorCode::Internal => SyncError::Network(self.error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorBody {
            status: "error".to_string(),
            code: self.code,
            error: self.message,
        });
        (status, body).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let code = match &err {
            SyncError::MissingIdentity => ErrorCode::MissingIdentity,
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            SyncError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            SyncError::SubscriptionNotFound(_) => ErrorCode::SubscriptionNotFound,
            SyncError::InvalidClientId(_)
            | SyncError::InvalidRequest(_)
            | SyncError::InvalidTable(_)
            | SyncError::InvalidFilter(_)
            | SyncError::Deserialization(_) => ErrorCode::InvalidInput,
            SyncError::Io(_)
            | SyncError::StoreUnavailable(_)
            | SyncError::Corruption(_)
            | SyncError::ChecksumMismatch { .. }
            | SyncError::InvalidFormat(_)
            | SyncError::Locked
            | SyncError::NotInitialized => ErrorCode::StoreUnavailable,
            SyncError::Serialization(_) | SyncError::Network(_) | SyncError::Config(_) => {
                ErrorCode::Internal
            }
        };

        if code.status_code().is_server_error() {
            tracing::error!(error = %err, "request failed");
        } else {
            tracing::debug!(error = %err, "request rejected");
        }

        let message = match err {
            SyncError::NotFound(key) => key,
            SyncError::AlreadyExists(key) => key,
            other => other.to_string(),
        };
        ApiError::new(code, message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::invalid_input(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::invalid_input(rejection.body_text())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
