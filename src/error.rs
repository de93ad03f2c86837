use crate::provider::UnknownProvider;
use thiserror::Error;

/// Failures raised on the aggregation path. Store errors propagate unchanged
/// so the HTTP boundary can log the cause and answer with a generic 500;
/// filter errors carry the message shown to the client as a 400.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("{0}")]
    InvalidFilter(String),
    #[error("usage record store unavailable: {0}")]
    Store(#[from] sqlx::Error),
}

impl UsageError {
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter(message.into())
    }
}

impl From<UnknownProvider> for UsageError {
    fn from(err: UnknownProvider) -> Self {
        Self::InvalidFilter(err.to_string())
    }
}
