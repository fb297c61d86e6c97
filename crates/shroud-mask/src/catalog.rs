//! Table descriptor lookup.

use shroud_core::TableCatalogConfig;

/// Source of ordered column lists, keyed by logical database and table.
pub trait TableCatalog: Send + Sync {
    /// Columns of `database.table` in schema order.
    fn columns(&self, database: &str, table: &str) -> Option<&[String]>;
}

impl TableCatalog for TableCatalogConfig {
    fn columns(&self, database: &str, table: &str) -> Option<&[String]> {
        TableCatalogConfig::columns(self, database, table)
    }
}
