use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Failure of a backend call as seen by the client.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{0}")]
    Api(ApiError),
    #[error("network failure: {0}")]
    Network(String),
}

impl BackendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendError::Api(err) => err.code,
            BackendError::Network(_) => ErrorCode::NetworkFailure,
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.code().user_message()
    }

    pub(crate) fn no_open_chat() -> Self {
        BackendError::Api(ApiError::invalid_argument("no chat is open"))
    }
}

impl From<ApiError> for BackendError {
    fn from(value: ApiError) -> Self {
        BackendError::Api(value)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        BackendError::Network(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        BackendError::Network(format!("websocket: {value}"))
    }
}
