//! sqlx-backed Postgres pools.

use crate::error::BackendError;
use crate::pool::{BackendConnection, ConnectionPool, PoolFactory, PooledConnection};
use crate::result::{ColumnInfo, QueryResult, pg_type_to_oid};
use async_trait::async_trait;
use shroud_core::{BackendAddr, SliceConfig};
use sqlx::Column as SqlxColumn;
use sqlx::TypeInfo;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Postgres, Row, Statement};
use std::sync::Arc;
use std::time::Duration;

/// Creates lazily connecting [`PgConnectionPool`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgPoolFactory;

impl PoolFactory for PgPoolFactory {
    fn create(
        &self,
        addr: &BackendAddr,
        slice: &SliceConfig,
    ) -> Result<Arc<dyn ConnectionPool>, BackendError> {
        let options = PgConnectOptions::new()
            .host(&addr.host)
            .port(addr.port)
            .username(&slice.user_name)
            .password(&slice.password)
            .database(&slice.database);

        let pool = PgPoolOptions::new()
            .min_connections(slice.capacity)
            .max_connections(slice.max_capacity)
            .idle_timeout(slice.idle_timeout())
            .connect_lazy_with(options);

        Ok(Arc::new(PgConnectionPool {
            addr: addr.to_string(),
            pool,
        }))
    }
}

/// A sqlx pool for one backend address.
#[derive(Debug)]
pub struct PgConnectionPool {
    addr: String,
    pool: PgPool,
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn get(&self, timeout: Duration) -> Result<PooledConnection, BackendError> {
        match tokio::time::timeout(timeout, self.pool.acquire()).await {
            Err(_) | Ok(Err(sqlx::Error::PoolTimedOut)) => Err(BackendError::AcquireTimeout {
                addr: self.addr.clone(),
                timeout,
            }),
            Ok(Err(sqlx::Error::PoolClosed)) => Err(BackendError::PoolClosed {
                addr: self.addr.clone(),
            }),
            Ok(Err(e)) => Err(BackendError::Connection {
                addr: self.addr.clone(),
                message: e.to_string(),
            }),
            Ok(Ok(conn)) => Ok(Box::new(PgBackendConnection {
                addr: self.addr.clone(),
                conn,
            })),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

struct PgBackendConnection {
    addr: String,
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl BackendConnection for PgBackendConnection {
    async fn query(&mut self, schema: &str, sql: &str) -> Result<QueryResult, BackendError> {
        // Pooled connections keep the search path of their previous user.
        sqlx::query(&search_path_statement(schema))
            .execute(&mut *self.conn)
            .await
            .map_err(|e| BackendError::Connection {
                addr: self.addr.clone(),
                message: e.to_string(),
            })?;

        let statement = (&mut *self.conn)
            .prepare(sql)
            .await
            .map_err(|e| self.query_error(e))?;
        let columns: Vec<ColumnInfo> = statement
            .columns()
            .iter()
            .map(|c| ColumnInfo {
                name: SqlxColumn::name(c).to_string(),
                type_oid: pg_type_to_oid(SqlxColumn::type_info(c).name()),
            })
            .collect();

        let rows = statement
            .query()
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| self.query_error(e))?;

        let data: Vec<Vec<Option<String>>> = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| decode_text(row, i)).collect())
            .collect();

        Ok(QueryResult {
            columns,
            row_count: data.len(),
            command_tag: format!("SELECT {}", data.len()),
            rows: data,
        })
    }
}

impl PgBackendConnection {
    fn query_error(&self, error: sqlx::Error) -> BackendError {
        match error {
            sqlx::Error::Database(db) => BackendError::Query(db.message().to_string()),
            other => BackendError::Connection {
                addr: self.addr.clone(),
                message: other.to_string(),
            },
        }
    }
}

/// Statement that points the session at `schema`, or back at the server
/// default when it is empty.
fn search_path_statement(schema: &str) -> String {
    if schema.is_empty() {
        "RESET search_path".to_string()
    } else {
        format!("SET search_path TO {}", quote_ident(schema))
    }
}

/// Render one value as text. NULL and undecodable values become `None`.
fn decode_text(row: &PgRow, i: usize) -> Option<String> {
    row.try_get::<String, _>(i)
        .ok()
        .or_else(|| row.try_get::<i32, _>(i).ok().map(|v| v.to_string()))
        .or_else(|| row.try_get::<i64, _>(i).ok().map(|v| v.to_string()))
        .or_else(|| row.try_get::<i16, _>(i).ok().map(|v| v.to_string()))
        .or_else(|| row.try_get::<f64, _>(i).ok().map(|v| v.to_string()))
        .or_else(|| row.try_get::<f32, _>(i).ok().map(|v| v.to_string()))
        .or_else(|| row.try_get::<bool, _>(i).ok().map(|v| v.to_string()))
        .or_else(|| {
            row.try_get::<chrono::NaiveDateTime, _>(i)
                .ok()
                .map(|v| v.to_string())
        })
        .or_else(|| {
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .ok()
                .map(|v| v.to_rfc3339())
        })
        .or_else(|| row.try_get::<chrono::NaiveDate, _>(i).ok().map(|v| v.to_string()))
        .or_else(|| row.try_get::<uuid::Uuid, _>(i).ok().map(|v| v.to_string()))
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
