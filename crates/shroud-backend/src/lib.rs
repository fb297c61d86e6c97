//! # shroud-backend
//!
//! Backend routing for the Shroud masking proxy.
//!
//! A namespace routes every statement through one [`Slice`]: a fixed set of
//! weighted backend endpoints, each owning a [`ConnectionPool`]. The slice
//! picks an endpoint with its [`Balancer`], a proportional schedule shuffled
//! once at construction, then waits a bounded time for a pooled connection.
//!
//! ```text
//! Slice
//!  ├── Balancer   [1, 0, 1, 2, 1, 0, ...]  (weights 2:3:1, shuffled)
//!  ├── Endpoint 0 ── ConnectionPool ── PooledConnection
//!  ├── Endpoint 1 ── ConnectionPool
//!  └── Endpoint 2 ── ConnectionPool
//! ```
//!
//! Pools are abstracted behind [`PoolFactory`] so reloads, tests and the
//! Postgres implementation in [`postgres`] share one code path.

pub mod balancer;
pub mod error;
pub mod introspect;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod result;
pub mod slice;

pub use balancer::Balancer;
pub use error::BackendError;
pub use pool::{BackendConnection, ConnectionPool, PoolFactory, PooledConnection};
pub use postgres::{PgConnectionPool, PgPoolFactory};
pub use result::{ColumnInfo, QueryResult};
pub use slice::{Endpoint, Slice};
