//! Errors raised by remote storage calls.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The service answered with a non-success HTTP status
    #[error("{operation} failed with HTTP {status}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to {operation} in {attempts} attempts due to 500 or 503 errors")]
    RetriesExhausted { operation: String, attempts: u32 },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Failed to refresh access token: {0}")]
    Authorization(String),
}

impl RemoteError {
    /// Transient server-side failures (HTTP 500 and 503) are worth retrying;
    /// everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api { status: 500 | 503, .. })
    }

    /// HTTP status of an API error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
