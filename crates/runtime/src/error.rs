//! Error types for the transport and pooling layer.

use thiserror::Error;

/// Errors surfaced by transports, connections, pools, and the registry.
///
/// Every variant is terminal for the resource it concerns; nothing here is
/// retried internally except the stale-pool case, which the registry
/// recovers from exactly once (see [`crate::registry::PoolRegistry`]).
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level failure: refused, TLS, abrupt disconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// The control endpoint rejected the upgrade with HTTP 404. The target
    /// does not speak control mode; callers fall back to direct mode.
    #[error("control mode not supported by target")]
    ControlUnsupported,

    /// Checkout attempted against a pool already at capacity.
    #[error("connection pool at capacity ({0} connections)")]
    PoolFull(usize),

    /// The pool actor behind a cached handle is gone.
    #[error("connection pool is no longer running")]
    StalePool,

    /// A second operation was started on a connection that is still leased.
    #[error("operation already in progress on this connection")]
    OperationInProgress,

    /// The connection actor has shut down.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the distinguished handshake-rejected outcome.
    pub fn is_control_unsupported(&self) -> bool {
        matches!(self, Error::ControlUnsupported)
    }
}
