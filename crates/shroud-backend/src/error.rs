//! Error types for the backend crate.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while routing to or talking with a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The slice has no usable endpoint.
    #[error("no backend available")]
    NoBackend,

    /// The pool stayed exhausted for the whole acquire window.
    #[error("timed out after {timeout:?} waiting for a connection to {addr}")]
    AcquireTimeout { addr: String, timeout: Duration },

    /// The pool was closed, usually because its namespace was retired.
    #[error("connection pool for {addr} is closed")]
    PoolClosed { addr: String },

    /// Establishing or using a backend connection failed.
    #[error("backend {addr}: {message}")]
    Connection { addr: String, message: String },

    /// The backend rejected the statement.
    #[error("{0}")]
    Query(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
