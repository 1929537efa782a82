//! Client-level errors.

use std::time::Duration;

use sprite_protocol::ApiError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport or connection-management failure.
    #[error(transparent)]
    Runtime(#[from] sprite_runtime::Error),

    /// Structured error response from the REST API.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// HTTP client failure before a response was decoded.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The exec session's actor is gone; no further events will arrive.
    #[error("exec session closed")]
    SessionClosed,
}

impl Error {
    /// Status code of the underlying API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(api) => Some(api.status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
