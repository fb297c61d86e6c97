//! Error types for the mask crate.

use thiserror::Error;

/// Errors that abort a statement before it reaches a backend.
#[derive(Debug, Error)]
pub enum MaskError {
    /// SQL parsing failed.
    #[error("failed to parse SQL: {0}")]
    Parse(String),

    /// An unqualified table was referenced without a selected database.
    #[error("no database selected")]
    DatabaseNotSelected,

    /// The statement contains a construct masking cannot be applied to.
    #[error("unsupported statement: {reason}")]
    Unsupported { reason: String },

    /// One alias names two different tables.
    #[error("alias {alias} refers to both {first} and {second}")]
    AliasConflict {
        alias: String,
        first: String,
        second: String,
    },

    /// The table has no descriptor.
    #[error("table {0} does not exist")]
    UnknownTable(String),

    /// A projected column matches nothing in scope.
    #[error("column {0} does not exist")]
    UnresolvedColumn(String),

    /// A mask rule names something that is not a function.
    #[error("invalid mask function {0:?}")]
    InvalidMaskFunction(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MaskError {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }
}
