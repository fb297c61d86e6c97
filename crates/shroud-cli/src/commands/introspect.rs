//! `shroud introspect`: fill `tables.yaml` from a live Postgres schema.

use shroud_backend::introspect::introspect_tables;
use shroud_core::TableCatalogConfig;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub async fn run_introspect(
    database_url: &str,
    database: &str,
    schema: &str,
    output: &Path,
) -> anyhow::Result<()> {
    let tables = introspect_tables(database_url, schema).await?;
    if tables.is_empty() {
        anyhow::bail!("schema {schema} has no tables");
    }
    let count = tables.len();
    merge_into(output, database, tables)?;

    println!("Wrote {count} table(s) of {database} to {}", output.display());
    Ok(())
}

/// Replace the entry of `database` in the catalog file at `path`, keeping
/// every other database. A missing file starts an empty catalog.
pub fn merge_into(
    path: &Path,
    database: &str,
    tables: BTreeMap<String, Vec<String>>,
) -> anyhow::Result<()> {
    let mut catalog: TableCatalogConfig = if path.is_file() {
        serde_yaml::from_str(&fs::read_to_string(path)?)?
    } else {
        TableCatalogConfig::default()
    };
    catalog.set_database(database, tables);
    fs::write(path, serde_yaml::to_string(&catalog)?)?;
    tracing::info!(path = %path.display(), database, "Updated table catalog");
    Ok(())
}
