//! Postgres wire protocol session handlers (pgwire 0.37).
//!
//! Every accepted connection gets its own [`ShroudServerHandlers`]: a
//! startup handler that authenticates against the namespace the port
//! belongs to, and a query handler that masks and forwards statements.
//! Both share the connection's [`SessionContext`].

use crate::error::ProxyError;
use crate::executor::{SliceExecutor, StatementRunner};
use crate::manager::Manager;
use crate::namespace::Namespace;
use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::{Sink, stream};
use parking_lot::Mutex;
use pgwire::api::auth::{
    DefaultServerParameterProvider, StartupHandler, finish_authentication, protocol_negotiation,
    save_startup_parameters_to_metadata,
};
use pgwire::api::query::SimpleQueryHandler;
use pgwire::api::results::{DataRowEncoder, FieldFormat, FieldInfo, QueryResponse, Response, Tag};
use pgwire::api::{ClientInfo, ClientPortalStore, PgWireConnectionState, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::startup::Authentication;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use shroud_backend::QueryResult;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Session state for a connected client.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub connection_id: String,
    /// Namespace of the port the client connected to.
    pub namespace: Arc<Namespace>,
    /// Set once authenticated.
    pub user: Option<String>,
    /// Logical database from the startup parameters.
    pub database: Option<String>,
    pub client_addr: Option<SocketAddr>,
}

impl SessionContext {
    pub fn new(namespace: Arc<Namespace>, client_addr: Option<SocketAddr>) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            namespace,
            user: None,
            database: None,
            client_addr,
        }
    }
}

/// Tracks session activity for the idle timeout.
#[derive(Debug)]
pub struct IdleTracker {
    timeout: Option<Duration>,
    last_active: Mutex<Instant>,
    busy: AtomicUsize,
}

impl IdleTracker {
    /// `None` disables the timeout.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            last_active: Mutex::new(Instant::now()),
            busy: AtomicUsize::new(0),
        }
    }

    /// Mark the session busy until the guard is dropped.
    pub fn begin(self: &Arc<Self>) -> BusyGuard {
        self.busy.fetch_add(1, Ordering::AcqRel);
        self.touch();
        BusyGuard(self.clone())
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Completes once the session has been idle for the timeout. A busy
    /// session never expires; without a timeout this never completes.
    pub async fn expired(&self) {
        let Some(timeout) = self.timeout else {
            return std::future::pending().await;
        };
        loop {
            let since = if self.busy.load(Ordering::Acquire) > 0 {
                Instant::now()
            } else {
                *self.last_active.lock()
            };
            let deadline = since + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Keeps an [`IdleTracker`] busy while alive.
#[derive(Debug)]
pub struct BusyGuard(Arc<IdleTracker>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.touch();
        self.0.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cleartext password authentication against the namespace's users.
pub struct ShroudStartupHandler {
    manager: Arc<Manager>,
    session: Arc<RwLock<SessionContext>>,
    parameter_provider: DefaultServerParameterProvider,
}

impl ShroudStartupHandler {
    pub fn new(manager: Arc<Manager>, session: Arc<RwLock<SessionContext>>) -> Self {
        Self {
            manager,
            session,
            parameter_provider: DefaultServerParameterProvider::default(),
        }
    }

    /// Check address, password and requested database. Returns the
    /// session's logical database.
    pub fn authenticate(
        &self,
        namespace: &Namespace,
        user: &str,
        password: &str,
        database: Option<&str>,
        ip: IpAddr,
    ) -> Result<Option<String>, ProxyError> {
        if !namespace.allows_ip(ip) {
            return Err(ProxyError::AccessDenied(ip.to_string()));
        }
        if !self
            .manager
            .current()
            .users
            .authenticate(namespace.name(), user, password)
        {
            return Err(ProxyError::AuthenticationFailed(user.to_string()));
        }
        match database.filter(|db| !db.is_empty()) {
            None => Ok(None),
            Some(db) if namespace.is_allowed_db(db) => Ok(Some(db.to_string())),
            Some(db) => Err(ProxyError::DatabaseNotAllowed(db.to_string())),
        }
    }
}

#[async_trait]
impl StartupHandler for ShroudStartupHandler {
    async fn on_startup<C>(&self, client: &mut C, message: PgWireFrontendMessage) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                protocol_negotiation(client, startup).await?;
                save_startup_parameters_to_metadata(client, startup);
                client.set_state(PgWireConnectionState::AuthenticationInProgress);
                client
                    .send(PgWireBackendMessage::Authentication(
                        Authentication::CleartextPassword,
                    ))
                    .await?;
            }
            PgWireFrontendMessage::PasswordMessageFamily(pwd) => {
                let password = pwd.into_password()?.password;
                let user = client.metadata().get("user").cloned().unwrap_or_default();
                let database = client.metadata().get("database").cloned();
                let peer = client.socket_addr();

                let mut session = self.session.write().await;
                let namespace = session.namespace.clone();
                match self.authenticate(&namespace, &user, &password, database.as_deref(), peer.ip()) {
                    Ok(database) => {
                        tracing::info!(
                            connection_id = %session.connection_id,
                            namespace = %namespace.name(),
                            user = %user,
                            database = ?database,
                            peer = %peer,
                            "Session started"
                        );
                        session.user = Some(user);
                        session.database = database;
                        session.client_addr = Some(peer);
                        drop(session);
                        finish_authentication(client, &self.parameter_provider).await?;
                    }
                    Err(ProxyError::AuthenticationFailed(user)) => {
                        tracing::warn!(namespace = %namespace.name(), user = %user, peer = %peer, "Authentication failed");
                        return Err(PgWireError::InvalidPassword(user));
                    }
                    Err(e) => {
                        tracing::warn!(namespace = %namespace.name(), user = %user, peer = %peer, error = %e, "Session refused");
                        return Err(error_response("FATAL", &e));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Masks and forwards simple-protocol queries.
pub struct ShroudQueryHandler {
    runner: StatementRunner,
    session: Arc<RwLock<SessionContext>>,
    idle: Arc<IdleTracker>,
}

impl ShroudQueryHandler {
    pub fn new(runner: StatementRunner, session: Arc<RwLock<SessionContext>>, idle: Arc<IdleTracker>) -> Self {
        Self {
            runner,
            session,
            idle,
        }
    }

    /// Run one statement for the session.
    pub async fn process_query(&self, sql: &str) -> Result<QueryResult, ProxyError> {
        let _busy = self.idle.begin();
        let session = self.session.read().await.clone();
        self.runner.run(&session, sql).await
    }
}

#[async_trait]
impl SimpleQueryHandler for ShroudQueryHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match self.process_query(query).await {
            Ok(result) => Ok(vec![encode_result(result)?]),
            Err(e) => Err(error_response("ERROR", &e)),
        }
    }
}

fn encode_result(result: QueryResult) -> PgWireResult<Response> {
    if !result.returns_rows() {
        return Ok(Response::Execution(Tag::new(&result.command_tag)));
    }

    let fields: Vec<FieldInfo> = result
        .columns
        .iter()
        .map(|c| FieldInfo::new(c.name.clone().into(), None, None, Type::TEXT, FieldFormat::Text))
        .collect();
    let schema = Arc::new(fields);

    let rows: Vec<PgWireResult<_>> = result
        .rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for value in row {
                encoder.encode_field(&value)?;
            }
            Ok(encoder.take_row())
        })
        .collect();

    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn error_response(severity: &str, error: &ProxyError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        severity.to_owned(),
        error.sqlstate().to_owned(),
        error.to_string(),
    )))
}

/// Handlers of one client connection.
pub struct ShroudServerHandlers {
    query_handler: Arc<ShroudQueryHandler>,
    startup_handler: Arc<ShroudStartupHandler>,
}

impl ShroudServerHandlers {
    pub fn new(query_handler: Arc<ShroudQueryHandler>, startup_handler: Arc<ShroudStartupHandler>) -> Self {
        Self {
            query_handler,
            startup_handler,
        }
    }

    /// Handlers sharing a fresh session bound to `namespace`.
    pub fn for_connection(
        manager: Arc<Manager>,
        namespace: Arc<Namespace>,
        peer: SocketAddr,
        idle: Arc<IdleTracker>,
    ) -> Arc<Self> {
        let session = Arc::new(RwLock::new(SessionContext::new(namespace, Some(peer))));
        let startup_handler = Arc::new(ShroudStartupHandler::new(manager.clone(), session.clone()));
        let runner = StatementRunner::new(manager, Box::new(SliceExecutor::new()));
        let query_handler = Arc::new(ShroudQueryHandler::new(runner, session, idle));
        Arc::new(Self::new(query_handler, startup_handler))
    }
}

impl PgWireServerHandlers for ShroudServerHandlers {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.query_handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.startup_handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerSettings;
    use shroud_backend::memory::MemoryPoolFactory;
    use shroud_core::{ConfigSet, NamespaceConfig};

    fn manager() -> Arc<Manager> {
        let namespace = NamespaceConfig::from_yaml(
            r#"
name: tenant_a
proxy_port: 6001
allowed_dbs: [shop]
allowed_ip: ["10.0.0.0/8"]
slice:
  user_name: proxy
  slaves: ["db:5432"]
users:
  - user_name: alice
    password: [pw1, pw2]
"#,
        )
        .unwrap();
        let mut set = ConfigSet::default();
        set.namespaces.insert(namespace.name.clone(), namespace);
        Arc::new(
            Manager::new(&set, Arc::new(MemoryPoolFactory::default()), ManagerSettings::default())
                .unwrap(),
        )
    }

    fn startup(manager: &Arc<Manager>) -> (ShroudStartupHandler, Arc<Namespace>) {
        let namespace = manager.namespace_by_port(6001).unwrap();
        let session = Arc::new(RwLock::new(SessionContext::new(namespace.clone(), None)));
        (ShroudStartupHandler::new(manager.clone(), session), namespace)
    }

    #[test]
    fn test_authenticate() {
        let manager = manager();
        let (handler, namespace) = startup(&manager);
        let inside: IpAddr = "10.0.0.7".parse().unwrap();
        let outside: IpAddr = "172.16.0.1".parse().unwrap();

        assert_eq!(
            handler.authenticate(&namespace, "alice", "pw2", Some("shop"), inside).unwrap(),
            Some("shop".to_string())
        );
        assert_eq!(handler.authenticate(&namespace, "alice", "pw1", None, inside).unwrap(), None);
        assert!(matches!(
            handler.authenticate(&namespace, "alice", "nope", None, inside),
            Err(ProxyError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            handler.authenticate(&namespace, "alice", "pw1", None, outside),
            Err(ProxyError::AccessDenied(_))
        ));
        assert!(matches!(
            handler.authenticate(&namespace, "alice", "pw1", Some("billing"), inside),
            Err(ProxyError::DatabaseNotAllowed(_))
        ));
    }

    #[test]
    fn test_encode_execution_and_rows() {
        let response = encode_result(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            command_tag: "SET".to_string(),
        })
        .unwrap();
        assert!(matches!(response, Response::Execution(_)));

        // No rows still describes the columns.
        let response = encode_result(QueryResult::text(&["id", "mobile"], Vec::new())).unwrap();
        match response {
            Response::Query(query) => assert_eq!(query.row_schema().len(), 2),
            _ => panic!("expected a query response"),
        }

        let response = encode_result(QueryResult::text(&["id"], vec![vec![Some("1".to_string())], vec![None]])).unwrap();
        assert!(matches!(response, Response::Query(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracker_expires_only_when_idle() {
        let idle = Arc::new(IdleTracker::new(Some(Duration::from_secs(10))));
        let busy = idle.begin();
        assert!(
            tokio::time::timeout(Duration::from_secs(30), idle.expired())
                .await
                .is_err()
        );
        drop(busy);
        let start = Instant::now();
        idle.expired().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracker_disabled() {
        let idle = IdleTracker::new(None);
        assert!(
            tokio::time::timeout(Duration::from_secs(3600), idle.expired())
                .await
                .is_err()
        );
    }
}
