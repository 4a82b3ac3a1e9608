//! Error types for the rollout engine

use thiserror::Error;

/// Main error type for the rollout engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Corrupt snapshot for session {0}")]
    CorruptSnapshot(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Escalation error: {0}")]
    EscalationError(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Process exit code for this error.
    ///
    /// `2` means the caller handed us something unusable (bad input, bad
    /// configuration, unknown session). Everything else leaves persisted state
    /// intact and resumable, which is reported as `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::ValidationError(_)
            | EngineError::ConfigError(_)
            | EngineError::PatternError(_)
            | EngineError::NotFound(_)
            | EngineError::InvalidTransition(_) => 2,
            _ => 1,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
