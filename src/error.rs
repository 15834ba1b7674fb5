/// Error types for the list sync service.
/// Every fallible operation in the crate returns `Result<T>` with `SyncError`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("XRPC error {status} {error}: {message}")]
    Xrpc {
        status: u16,
        error: String,
        message: String,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Resolution error: {0}")]
    Resolve(String),

    #[error("Remote write failed: {0}")]
    RemoteWrite(String),
}

impl SyncError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Http(_) => true,
            SyncError::Xrpc { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether the PDS rejected the request because the access token is stale.
    pub fn is_expired_token(&self) -> bool {
        matches!(
            self,
            SyncError::Xrpc { status, error, .. } if *status == 401 || error == "ExpiredToken"
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocket(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
