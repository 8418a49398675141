use std::time::Duration;

use cf_core::FieldError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote compute timed out after {0:?}")]
    Timeout(Duration),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error("local evaluation aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl RouterError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RouterError::Http(e) => !e.is_builder() && !e.is_decode(),
            RouterError::Timeout(_) => true,
            RouterError::Status { status, .. } => *status == 429 || *status >= 500,
            RouterError::Cancelled | RouterError::Field(_) | RouterError::Aborted(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
