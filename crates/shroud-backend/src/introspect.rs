use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

/// Read the ordered column lists of every base table in `schema`.
///
/// The result has the shape of one database entry of `tables.yaml`.
pub async fn introspect_tables(
    database_url: &str,
    schema: &str,
) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    let pool = PgPool::connect(database_url).await?;

    let rows = sqlx::query(
        r#"
        select c.table_name, c.column_name
        from information_schema.columns c
        join information_schema.tables t
          on t.table_schema = c.table_schema
         and t.table_name = c.table_name
        where c.table_schema = $1
          and t.table_type in ('BASE TABLE', 'VIEW')
        order by c.table_name, c.ordinal_position
        "#,
    )
    .bind(schema)
    .fetch_all(&pool)
    .await?;

    let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let table_name: String = row.get("table_name");
        let column_name: String = row.get("column_name");
        tables.entry(table_name).or_default().push(column_name);
    }

    tracing::info!(schema, tables = tables.len(), "Introspected table columns");
    pool.close().await;

    Ok(tables)
}
