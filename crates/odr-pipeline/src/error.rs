//! Error types for pipeline workers
//!
//! Every failure a stage can hit maps onto one of these variants. The worker
//! loop uses [`PipelineError::is_transient`] to decide whether a failed job is
//! worth another attempt.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Login was rejected or returned no token
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Non-2xx response, transport failure, or unparseable body
    #[error("API call to {url} failed: {reason}")]
    ApiCallFailed { url: String, reason: String },

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Tracked job not found: {0}")]
    JobNotFound(i64),

    #[error("File operation on '{}' failed: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Payload or response violated an expected shape
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Another run already holds the single-flight lock
    #[error("Pipeline busy: {0}")]
    Busy(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] odr_common::OdrError),
}

impl PipelineError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn api(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ApiCallFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn file_io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether retrying the same job later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::ApiCallFailed { .. }
                | PipelineError::Queue(_)
                | PipelineError::Busy(_)
                | PipelineError::FileIo { .. }
                | PipelineError::Io(_)
        )
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::api("http://x", "503").is_transient());
        assert!(PipelineError::Busy("analyzer".into()).is_transient());
        assert!(!PipelineError::JobNotFound(7).is_transient());
        assert!(!PipelineError::auth("bad credentials").is_transient());
        assert!(!PipelineError::validation("bad payload").is_transient());
    }

    #[test]
    fn test_file_io_message_names_path() {
        let err = PipelineError::file_io(
            "/tmp/out/mineral_data.js",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/out/mineral_data.js"));
    }
}
