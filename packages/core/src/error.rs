//! Validation errors for submissions and configuration.

use thiserror::Error;

/// Input rejected before it reaches the store. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("job command is missing or blank")]
    MissingCommand,
    #[error("job command or arguments contain a NUL byte")]
    NulByte,
    #[error("job timeout must be at least one second")]
    ZeroTimeout,
    #[error("job timeout must be at most {max} seconds")]
    TimeoutTooLarge { max: u64 },
    #[error("unknown job state: {0}")]
    UnknownState(String),
    #[error("unknown configuration key: {0}")]
    UnknownConfigKey(String),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ValidationError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
