use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    AlreadyExists,
    NotFound,
    InvalidArgument,
    Unauthenticated,
    Internal,
    NetworkFailure,
}

impl ErrorCode {
    /// Text shown to the user when an operation fails with this code.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "You don't have permission to do that",
            ErrorCode::AlreadyExists => "That already exists",
            ErrorCode::NotFound => "Not found",
            ErrorCode::InvalidArgument => "Some required information is missing or invalid",
            ErrorCode::Unauthenticated => "Please sign in again",
            ErrorCode::Internal => "Something went wrong, please try again",
            ErrorCode::NetworkFailure => "Network error, check your connection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
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

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_travels_as_json_and_as_a_std_error() {
        let err = ApiError::not_found("no pending request from this user");
        let json = serde_json::to_value(&err).expect("json");
        assert_eq!(json["code"], "not_found");

        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert_eq!(boxed.to_string(), "NotFound: no pending request from this user");
    }
}
