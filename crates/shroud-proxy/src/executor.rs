//! Statement execution.

use crate::error::ProxyError;
use crate::handler::SessionContext;
use crate::manager::Manager;
use crate::plan::{Plan, PlanContext, Planner};
use async_trait::async_trait;
use shroud_backend::{QueryResult, Slice};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Runs planned SQL on a backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `sql` on a connection of `slice` with `schema` as search path.
    async fn execute(&self, slice: &Slice, schema: &str, sql: &str) -> Result<QueryResult, ProxyError>;

    fn set_last_insert_id(&self, id: u64);

    fn last_insert_id(&self) -> u64;
}

/// Executes through the slice's balancer, one pooled connection per
/// statement.
///
/// The last insert id follows `lastval()`: a single-value result of a
/// `lastval` column is remembered for `SELECT LAST_INSERT_ID()`.
#[derive(Debug, Default)]
pub struct SliceExecutor {
    last_insert_id: AtomicU64,
}

impl SliceExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Executor for SliceExecutor {
    async fn execute(&self, slice: &Slice, schema: &str, sql: &str) -> Result<QueryResult, ProxyError> {
        let mut connection = slice.acquire().await?;
        let result = connection.query(schema, sql).await?;

        if let [column] = result.columns.as_slice() {
            if column.name.eq_ignore_ascii_case("lastval") {
                let id = result
                    .rows
                    .first()
                    .and_then(|row| row.first())
                    .and_then(|value| value.as_deref())
                    .and_then(|value| value.parse().ok());
                if let Some(id) = id {
                    self.set_last_insert_id(id);
                }
            }
        }
        Ok(result)
    }

    fn set_last_insert_id(&self, id: u64) {
        self.last_insert_id.store(id, Ordering::Relaxed);
    }

    fn last_insert_id(&self) -> u64 {
        self.last_insert_id.load(Ordering::Relaxed)
    }
}

/// Plans and executes the statements of one session.
pub struct StatementRunner {
    manager: Arc<Manager>,
    planner: Planner,
    executor: Box<dyn Executor>,
}

impl StatementRunner {
    pub fn new(manager: Arc<Manager>, executor: Box<dyn Executor>) -> Self {
        Self {
            manager,
            planner: Planner::new(),
            executor,
        }
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Plan `sql` against the current generation and run it.
    pub async fn run(&self, session: &SessionContext, sql: &str) -> Result<QueryResult, ProxyError> {
        let generation = self.manager.current();
        let namespace = session.namespace.as_ref();
        let user = session.user.as_deref().unwrap_or_default();
        let ctx = PlanContext {
            generation: &generation,
            namespace,
            database: session.database.as_deref(),
            user,
            client_ip: session.client_addr.map(|addr| addr.ip()),
            now: chrono::Local::now(),
        };

        let plan = self.planner.plan(&ctx, sql).inspect_err(|e| {
            tracing::debug!(
                connection_id = %session.connection_id,
                namespace = %namespace.name(),
                error = %e,
                "Statement rejected"
            );
        })?;
        // Registries are not needed past planning.
        drop(generation);

        match plan {
            Plan::LastInsertId => Ok(QueryResult::text(
                &["last_insert_id"],
                vec![vec![Some(self.executor.last_insert_id().to_string())]],
            )),
            Plan::Forward {
                schema,
                sql: rewritten,
                report,
            } => {
                tracing::debug!(
                    connection_id = %session.connection_id,
                    namespace = %namespace.name(),
                    schema = %schema,
                    original = %sql,
                    rewritten = %rewritten,
                    masked = report.masked,
                    "Statement rewritten"
                );

                let start = Instant::now();
                let result = self
                    .executor
                    .execute(namespace.slice(), &schema, &rewritten)
                    .await;
                let elapsed = start.elapsed();

                if let Some(threshold) = namespace.slow_sql_threshold() {
                    if elapsed > threshold {
                        tracing::warn!(
                            namespace = %namespace.name(),
                            user = %user,
                            elapsed_ms = elapsed.as_millis() as u64,
                            threshold_ms = threshold.as_millis() as u64,
                            sql = %rewritten,
                            "Slow SQL"
                        );
                    }
                }
                result
            }
        }
    }
}
