use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Poll {0} not found")]
    NotFound(String),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Stale snapshot from {incoming}, already holding {held}")]
    StaleData {
        incoming: DateTime<Utc>,
        held: DateTime<Utc>,
    },
}

// What the view exposes; the message text only goes to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    NotFound,
    Server,
    Channel,
    StaleData,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Server(_) => ErrorKind::Server,
            SyncError::Channel(_) => ErrorKind::Channel,
            SyncError::StaleData { .. } => ErrorKind::StaleData,
        }
    }

    // NotFound is terminal for the poll id; stale data is dropped, not retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Server(_) | SyncError::Channel(_)
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Network => "network unavailable",
            ErrorKind::NotFound => "poll not found",
            ErrorKind::Server => "server error",
            ErrorKind::Channel => "live updates unavailable",
            ErrorKind::StaleData => "stale data",
        };
        f.write_str(label)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            if status == reqwest::StatusCode::NOT_FOUND {
                let path = error
                    .url()
                    .map(|url| url.path().to_string())
                    .unwrap_or_default();
                return SyncError::NotFound(path);
            }
            return SyncError::Server(error.to_string());
        }
        if error.is_decode() {
            return SyncError::Server(format!("Malformed response body: {}", error));
        }
        SyncError::Network(error.to_string())
    }
}

impl From<tungstenite::Error> for SyncError {
    fn from(error: tungstenite::Error) -> Self {
        SyncError::Channel(error.to_string())
    }
}
