//! Error types for the proxy crate.

use shroud_backend::BackendError;
use shroud_core::ConfigError;
use shroud_mask::MaskError;
use thiserror::Error;

/// Errors that can occur in the masking proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid configuration; a reload attempt is aborted.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No usable backend, or the backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The statement cannot be masked safely.
    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    /// Authentication failed.
    #[error("authentication failed for user {0}")]
    AuthenticationFailed(String),

    /// Client address not in the namespace's allowed list.
    #[error("access denied for {0}")]
    AccessDenied(String),

    #[error("database {0} is not allowed in this namespace")]
    DatabaseNotAllowed(String),

    /// Statement matched a blacklist pattern.
    #[error("statement forbidden by pattern {0:?}")]
    Forbidden(String),

    /// Failed to bind to the listen address.
    #[error("failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    /// Commit without a prepared generation.
    #[error("no prepared generation to commit")]
    NothingStaged,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// SQLSTATE reported to the client.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ProxyError::Mask(e) => match e {
                MaskError::Parse(_) => "42601",
                MaskError::DatabaseNotSelected => "3D000",
                MaskError::Unsupported { .. } => "0A000",
                MaskError::AliasConflict { .. } => "42712",
                MaskError::UnknownTable(_) => "42P01",
                MaskError::UnresolvedColumn(_) => "42703",
                MaskError::InvalidMaskFunction(_) | MaskError::Internal(_) => "XX000",
            },
            ProxyError::Backend(BackendError::Query(_) | BackendError::Internal(_)) => "XX000",
            ProxyError::Backend(_) => "08006",
            ProxyError::AuthenticationFailed(_) => "28P01",
            ProxyError::AccessDenied(_) | ProxyError::Forbidden(_) => "42501",
            ProxyError::DatabaseNotAllowed(_) => "42501",
            ProxyError::NamespaceNotFound(_) => "08004",
            ProxyError::Config(_)
            | ProxyError::BindFailed { .. }
            | ProxyError::NothingStaged
            | ProxyError::Internal(_) => "XX000",
        }
    }
}
