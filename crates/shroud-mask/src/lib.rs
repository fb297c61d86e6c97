//! # shroud-mask
//!
//! Field lineage and mask rewriting for Shroud.
//!
//! For every projected output column of a `SELECT` the [`LineageResolver`]
//! determines which table column it comes from. The [`MaskRewriter`] then
//! wraps every output column whose origin has a mask rule in the rule's
//! function, keeping the column name the client sees:
//!
//! **Before (from client):**
//! ```sql
//! SELECT id, mobile FROM customer
//! ```
//!
//! **After (to Postgres):**
//! ```sql
//! SELECT id, MASK_PHONE(mobile) AS mobile FROM customer
//! ```
//!
//! Masking is fail-closed. Aggregates, window functions, casts and
//! non-trivial functions over columns reject the statement, as does any
//! expression that reads a masked column, because the rewrite could not keep
//! one masked value per output cell.

pub mod catalog;
pub mod error;
pub mod lineage;
pub mod parser;
pub mod policy;
pub mod rewriter;

pub use catalog::TableCatalog;
pub use error::MaskError;
pub use lineage::{
    ColumnOrigin, FieldRelation, LineageResolver, ProjectionLineage, Provenance, SelectLineage,
    check_indirect_reads, check_supported,
};
pub use parser::{SqlAnalyzer, StatementKind, TableReference, is_system_schema};
pub use policy::{MaskPolicy, MaskRule};
pub use rewriter::{MaskRewriter, RewriteReport, validate_mask_function};
