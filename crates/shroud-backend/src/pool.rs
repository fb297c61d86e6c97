//! Connection pool abstraction.

use crate::error::BackendError;
use crate::result::QueryResult;
use async_trait::async_trait;
use shroud_core::{BackendAddr, SliceConfig};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// A physical backend connection checked out of a pool.
///
/// Dropping the connection returns it to its pool, so every exit path of a
/// request (success, error, cancellation) releases it.
#[async_trait]
pub trait BackendConnection: Send {
    /// Run one statement with `schema` as the active schema. An empty
    /// schema keeps the connection's default search path.
    async fn query(&mut self, schema: &str, sql: &str) -> Result<QueryResult, BackendError>;
}

pub type PooledConnection = Box<dyn BackendConnection>;

/// A pool of connections to one backend address.
#[async_trait]
pub trait ConnectionPool: Send + Sync + Debug {
    fn addr(&self) -> &str;

    /// Check out a connection, waiting at most `timeout`.
    async fn get(&self, timeout: Duration) -> Result<PooledConnection, BackendError>;

    /// Close the pool. Connections already checked out finish normally and
    /// are discarded on release.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates the pool of one slice endpoint.
pub trait PoolFactory: Send + Sync {
    fn create(
        &self,
        addr: &BackendAddr,
        slice: &SliceConfig,
    ) -> Result<Arc<dyn ConnectionPool>, BackendError>;
}
