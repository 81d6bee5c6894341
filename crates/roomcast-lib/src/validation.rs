//! Request field validation.

use regex::Regex;
use thiserror::Error;

use crate::error::AppError;

const MIN_ROOM_NAME_LENGTH: usize = 3;
const MAX_ROOM_NAME_LENGTH: usize = 100;
const MIN_ROOM_PASSWORD_LENGTH: usize = 6;
const MAX_ROOM_PASSWORD_LENGTH: usize = 100;

/// Possible validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid room name ({MIN_ROOM_NAME_LENGTH} - {MAX_ROOM_NAME_LENGTH} chars)")]
    InvalidRoomName,

    #[error("invalid password ({MIN_ROOM_PASSWORD_LENGTH} - {MAX_ROOM_PASSWORD_LENGTH} chars)")]
    InvalidRoomPassword,

    #[error("invalid handle")]
    InvalidHandle,
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

/// A room name is optional; when present it must be 3–100 characters.
pub fn validate_room_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Ok(());
    }
    if name.len() < MIN_ROOM_NAME_LENGTH || name.len() > MAX_ROOM_NAME_LENGTH {
        return Err(ValidationError::InvalidRoomName);
    }
    Ok(())
}

pub fn validate_room_password(password: &str) -> Result<(), ValidationError> {
    if password.len() < MIN_ROOM_PASSWORD_LENGTH || password.len() > MAX_ROOM_PASSWORD_LENGTH {
        return Err(ValidationError::InvalidRoomPassword);
    }
    Ok(())
}

/// A handle must match the configured `peer_handle_format`.
pub fn validate_handle(handle: &str, format: &Regex) -> Result<(), ValidationError> {
    if !format.is_match(handle) {
        return Err(ValidationError::InvalidHandle);
    }
    Ok(())
}
