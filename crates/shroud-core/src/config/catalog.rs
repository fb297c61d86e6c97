//! Table descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `database -> table -> ordered columns`, as found in `tables.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableCatalogConfig(pub BTreeMap<String, BTreeMap<String, Vec<String>>>);

impl TableCatalogConfig {
    /// Columns of `database.table` in schema order. Names compare
    /// case-insensitively.
    pub fn columns(&self, database: &str, table: &str) -> Option<&[String]> {
        let tables = self
            .0
            .iter()
            .find(|(db, _)| db.eq_ignore_ascii_case(database))
            .map(|(_, tables)| tables)?;
        tables
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, columns)| columns.as_slice())
    }

    /// Replace the descriptors of one database.
    pub fn set_database(&mut self, database: &str, tables: BTreeMap<String, Vec<String>>) {
        self.0.insert(database.to_string(), tables);
    }

    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
