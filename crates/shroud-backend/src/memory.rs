//! In-memory pools for tests.
//!
//! A [`MemoryPool`] enforces its capacity like a real pool and records every
//! statement it receives. Results come from a responder; the default one
//! echoes the statement back as a single `sql` column.

use crate::error::BackendError;
use crate::pool::{BackendConnection, ConnectionPool, PoolFactory, PooledConnection};
use crate::result::QueryResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use shroud_core::{BackendAddr, SliceConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub type Responder = Arc<dyn Fn(&str, &str) -> Result<QueryResult, BackendError> + Send + Sync>;

/// A statement as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub schema: String,
    pub sql: String,
}

pub struct MemoryPool {
    addr: String,
    permits: Arc<Semaphore>,
    executed: Arc<Mutex<Vec<Executed>>>,
    responder: Responder,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("addr", &self.addr)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl MemoryPool {
    pub fn new(addr: impl Into<String>, capacity: usize, responder: Responder) -> Self {
        Self {
            addr: addr.into(),
            permits: Arc::new(Semaphore::new(capacity)),
            executed: Arc::new(Mutex::new(Vec::new())),
            responder,
        }
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().clone()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Echo the statement back as one `sql` column.
pub fn echo_responder() -> Responder {
    Arc::new(|_: &str, sql: &str| Ok(QueryResult::text(&["sql"], vec![vec![Some(sql.to_string())]])))
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn get(&self, timeout: Duration) -> Result<PooledConnection, BackendError> {
        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Err(_) => {
                return Err(BackendError::AcquireTimeout {
                    addr: self.addr.clone(),
                    timeout,
                });
            }
            Ok(Err(_)) => {
                return Err(BackendError::PoolClosed {
                    addr: self.addr.clone(),
                });
            }
            Ok(Ok(permit)) => permit,
        };
        Ok(Box::new(MemoryConnection {
            _permit: permit,
            executed: self.executed.clone(),
            responder: self.responder.clone(),
        }))
    }

    async fn close(&self) {
        self.permits.close();
    }

    fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

struct MemoryConnection {
    _permit: OwnedSemaphorePermit,
    executed: Arc<Mutex<Vec<Executed>>>,
    responder: Responder,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn query(&mut self, schema: &str, sql: &str) -> Result<QueryResult, BackendError> {
        self.executed.lock().push(Executed {
            schema: schema.to_string(),
            sql: sql.to_string(),
        });
        (self.responder)(schema, sql)
    }
}

/// Hands out [`MemoryPool`]s sized by the slice's `max_capacity` and keeps
/// every pool it created for inspection.
pub struct MemoryPoolFactory {
    responder: Responder,
    pools: Mutex<Vec<Arc<MemoryPool>>>,
}

impl Default for MemoryPoolFactory {
    fn default() -> Self {
        Self::with_responder(echo_responder())
    }
}

impl MemoryPoolFactory {
    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder,
            pools: Mutex::new(Vec::new()),
        }
    }

    pub fn pools(&self) -> Vec<Arc<MemoryPool>> {
        self.pools.lock().clone()
    }

    /// Every statement executed through pools of this factory.
    pub fn executed(&self) -> Vec<Executed> {
        self.pools.lock().iter().flat_map(|p| p.executed()).collect()
    }
}

impl PoolFactory for MemoryPoolFactory {
    fn create(
        &self,
        addr: &BackendAddr,
        slice: &SliceConfig,
    ) -> Result<Arc<dyn ConnectionPool>, BackendError> {
        let pool = Arc::new(MemoryPool::new(
            addr.to_string(),
            slice.max_capacity as usize,
            self.responder.clone(),
        ));
        self.pools.lock().push(pool.clone());
        Ok(pool)
    }
}
