//! Error types for rescache core

use thiserror::Error;

/// Errors that can occur in rescache core
///
/// Cloneable so a single failure can be stored as a resource's last error and
/// handed to every watcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Network error: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Resource not downloaded: {0}")]
    NotDownloaded(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Server answered with a non-success status
    pub fn http_status(status: u16, url: &str) -> Self {
        CacheError::Network {
            status: Some(status),
            message: format!("{} returned HTTP {}", url, status),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Network { status: None, .. } => true,
            CacheError::Network {
                status: Some(status),
                ..
            } => *status >= 500,
            _ => false,
        }
    }

    /// Storage and cipher failures share the same reporting path
    pub fn is_storage(&self) -> bool {
        matches!(self, CacheError::Storage(_) | CacheError::Cipher(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        CacheError::Storage(error.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        CacheError::Network {
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        CacheError::Serialization(error.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(error: tokio::task::JoinError) -> Self {
        CacheError::Storage(format!("background task failed: {}", error))
    }
}

impl From<CacheError> for String {
    fn from(error: CacheError) -> Self {
        error.to_string()
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
