//! # shroud-proxy
//!
//! Postgres wire protocol proxy that masks sensitive columns.
//!
//! Every namespace (tenant) listens on its own port. A client that connects
//! to a port is authenticated against that namespace's users and bound to the
//! namespace for the rest of the session. Each statement is then:
//!
//! 1. checked against the namespace blacklist,
//! 2. parsed and limited to queries and `EXPLAIN`,
//! 3. resolved to field lineage and rewritten with the mask rules of the
//!    databases it reads, minus whatever the user's active whitelist exempts,
//! 4. renamed from logical to physical databases,
//! 5. executed on a backend picked by the namespace slice's balancer.
//!
//! All tenant configuration lives in a [`Generation`] owned by the
//! [`Manager`], which swaps generations atomically on reload.

pub mod error;
pub mod executor;
pub mod handler;
pub mod manager;
pub mod namespace;
pub mod plan;
pub mod registry;
pub mod server;
pub mod watcher;

pub use error::ProxyError;
pub use executor::{Executor, SliceExecutor, StatementRunner};
pub use handler::{
    IdleTracker, SessionContext, ShroudQueryHandler, ShroudServerHandlers, ShroudStartupHandler,
};
pub use manager::{Generation, Manager, ManagerSettings};
pub use namespace::Namespace;
pub use plan::{Plan, PlanContext, Planner};
pub use registry::{DBManager, NamespaceManager, RuleManager, UserManager, WhiteListManager};
pub use server::Server;
pub use watcher::ConfigWatcher;
