//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StoreError;

/// Application error kinds with their HTTP surface.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("incorrect password")]
    InvalidRoomPassword,

    #[error("incorrect password")]
    InvalidUserPassword,

    #[error("user is already connected")]
    AlreadyConnected,

    #[error("invalid autologin token")]
    InvalidToken,

    #[error("invalid session")]
    InvalidSession,

    #[error("room is invalid or has expired")]
    RoomNotFound,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("too many requests")]
    RateLimited,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRoomPassword
            | AppError::InvalidUserPassword
            | AppError::AlreadyConnected
            | AppError::InvalidToken
            | AppError::InvalidSession => StatusCode::FORBIDDEN,
            AppError::RoomNotFound | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RoomNotFound => AppError::RoomNotFound,
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Envelope for all JSON API responses.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub error: Option<String>,
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { error: None, data }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Envelope {
            error: Some(self.to_string()),
            data: serde_json::Value::Null,
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_errors_surface_as_incorrect_password() {
        assert_eq!(AppError::InvalidRoomPassword.to_string(), "incorrect password");
        assert_eq!(AppError::InvalidUserPassword.to_string(), "incorrect password");
        assert_eq!(
            AppError::InvalidRoomPassword.status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(AppError::RoomNotFound.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Storage("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::AlreadyConnected.status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn store_error_conversion() {
        let err: AppError = StoreError::RoomNotFound.into();
        assert!(matches!(err, AppError::RoomNotFound));

        let err: AppError = StoreError::RoomExists.into();
        assert!(matches!(err, AppError::Storage(_)));
    }
}
