use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{message}")]
    Status { status: u16, message: String },

    /// Both the access token and a refreshed one were rejected. Stored
    /// credentials have been cleared by the time this is returned.
    #[error("session expired; sign in again")]
    SessionExpired,

    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("{operation} timed out after {}s", .waited.as_secs())]
    Timeout {
        operation: &'static str,
        waited: Duration,
    },

    #[error("video processing failed: {0}")]
    VideoFailed(String),

    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn status(status: u16, message: Option<String>) -> Self {
        let message = message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("Request failed with status {}", status));
        Self::Status { status, message }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
