//! Error handling for the event hub

use std::fmt;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Hub error types
#[derive(Debug, Clone)]
pub enum HubError {
    /// Invalid hub configuration
    Config(String),
    /// Internal errors (task join failures, runtime plumbing)
    Internal(String),
}

impl HubError {
    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        HubError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        HubError::Internal(msg.into())
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Config(msg) => write!(f, "Configuration error: {}", msg),
            HubError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HubError {}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Internal(format!("IO error: {}", err))
    }
}
