//! Error types for enrichq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("fetch failed with status {status}: {body}")]
    Fetch { status: u16, body: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("task dropped before it ran")]
    TaskDropped,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures of a single population attempt (network, status, payload).
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Error::Fetch { .. } | Error::Http(_) | Error::Malformed(_) | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
