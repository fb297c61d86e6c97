//! Statement results as forwarded to clients.

/// Result of a statement execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column information.
    pub columns: Vec<ColumnInfo>,
    /// Row data as text.
    pub rows: Vec<Vec<Option<String>>>,
    /// Number of rows affected/returned.
    pub row_count: usize,
    /// Command completion tag.
    pub command_tag: String,
}

impl QueryResult {
    /// A text-only result set.
    pub fn text(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> Self {
        let row_count = rows.len();
        Self {
            columns: columns
                .iter()
                .map(|name| ColumnInfo {
                    name: name.to_string(),
                    type_oid: TEXT_OID,
                })
                .collect(),
            rows,
            row_count,
            command_tag: format!("SELECT {row_count}"),
        }
    }

    /// Whether the statement produced a result set, possibly empty.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty() || self.command_tag.starts_with("SELECT")
    }
}

/// Column information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// PostgreSQL type OID.
    pub type_oid: u32,
}

pub const TEXT_OID: u32 = 25;

/// Map type name to PostgreSQL type OID.
pub fn pg_type_to_oid(type_name: &str) -> u32 {
    match type_name.to_uppercase().as_str() {
        "INT4" => 23,
        "INT8" => 20,
        "INT2" => 21,
        "TEXT" => TEXT_OID,
        "VARCHAR" => 1043,
        "BPCHAR" => 1042,
        "BOOL" => 16,
        "FLOAT4" => 700,
        "FLOAT8" => 701,
        "NUMERIC" => 1700,
        "TIMESTAMP" => 1114,
        "TIMESTAMPTZ" => 1184,
        "DATE" => 1082,
        "UUID" => 2950,
        "JSON" => 114,
        "JSONB" => 3802,
        _ => TEXT_OID,
    }
}
