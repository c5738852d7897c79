//! Error types shared across ODR crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, OdrError>;

/// Main error type for shared ODR code
#[derive(Error, Debug)]
pub enum OdrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl OdrError {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
