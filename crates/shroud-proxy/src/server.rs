//! Per-namespace listeners and the reload loop.

use crate::error::ProxyError;
use crate::handler::{IdleTracker, ShroudServerHandlers};
use crate::manager::{Manager, ManagerSettings};
use crate::watcher::ConfigWatcher;
use shroud_backend::PoolFactory;
use shroud_core::{ConfigError, ConfigSet, ProxyConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The Shroud proxy: one listener per namespace port, all sharing a
/// [`Manager`].
pub struct Server {
    config: ProxyConfig,
    manager: Arc<Manager>,
    listeners: Mutex<BTreeMap<u16, JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: ProxyConfig, manager: Arc<Manager>) -> Self {
        Self {
            config,
            manager,
            listeners: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the configuration directory and build the first generation.
    pub async fn bootstrap(config: ProxyConfig, factory: Arc<dyn PoolFactory>) -> Result<Self, ProxyError> {
        let set = load_config_dir(config.config_dir.clone()).await?;
        let manager = Manager::new(&set, factory, ManagerSettings::from_config(&config))?;
        Ok(Self::new(config, Arc::new(manager)))
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Ports with a running listener.
    pub async fn listening_ports(&self) -> Vec<u16> {
        self.listeners.lock().await.keys().copied().collect()
    }

    /// Match listeners to the current generation: open listeners for new
    /// ports and stop those whose namespace is gone. Sessions already
    /// accepted keep running.
    ///
    /// Every port is attempted; the first bind failure is returned.
    pub async fn sync_listeners(&self) -> Result<(), ProxyError> {
        let ports: BTreeSet<u16> = self.manager.current().namespaces.ports().collect();
        let mut listeners = self.listeners.lock().await;

        listeners.retain(|port, handle| {
            if ports.contains(port) {
                return true;
            }
            handle.abort();
            tracing::info!(port, "Closed listener");
            false
        });

        let mut first_error = None;
        for port in ports {
            if listeners.contains_key(&port) {
                continue;
            }
            let address = format!("{}:{port}", self.config.listen_addr);
            match TcpListener::bind(&address).await {
                Ok(listener) => {
                    tracing::info!(address = %address, "Listener opened");
                    let handle = tokio::spawn(accept_loop(
                        listener,
                        port,
                        self.manager.clone(),
                        self.config.session_timeout(),
                    ));
                    listeners.insert(port, handle);
                }
                Err(source) => {
                    tracing::error!(address = %address, error = %source, "Failed to bind listener");
                    first_error.get_or_insert(ProxyError::BindFailed { address, source });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rescan the configuration directory and swap in a new generation.
    /// On failure the active generation stays.
    pub async fn reload(&self) -> Result<(), ProxyError> {
        let set = load_config_dir(self.config.config_dir.clone()).await?;
        self.manager.reload_all_prepare(&set)?;
        self.manager.reload_all_commit()?;
        self.sync_listeners().await
    }

    /// Serve until interrupted.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        self.sync_listeners().await?;

        let watcher = ConfigWatcher::new(self.config.config_dir.clone(), self.config.reload_interval());
        let watch = tokio::spawn(watcher.run(self.clone()));

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("failed to listen for shutdown signal: {e}"))?;
        tracing::info!("Shutting down");

        watch.abort();
        self.shutdown().await;
        Ok(())
    }

    /// Stop every listener and close the current namespaces' pools.
    pub async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (port, handle) in std::mem::take(&mut *listeners) {
            handle.abort();
            tracing::info!(port, "Closed listener");
        }
        for namespace in self.manager.current().namespaces.iter() {
            namespace.close().await;
        }
    }
}

async fn load_config_dir(dir: PathBuf) -> Result<ConfigSet, ProxyError> {
    let set = tokio::task::spawn_blocking(move || {
        let set = ConfigSet::load_dir(&dir)?;
        set.verify()?;
        Ok::<_, ConfigError>(set)
    })
    .await
    .map_err(|e| anyhow::anyhow!("configuration loader panicked: {e}"))??;
    Ok(set)
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    manager: Arc<Manager>,
    session_timeout: Option<Duration>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(port, error = %e, "Failed to accept connection");
                continue;
            }
        };

        let Some(namespace) = manager.namespace_by_port(port) else {
            tracing::warn!(port, peer = %peer, "No namespace owns this port");
            continue;
        };
        tracing::debug!(namespace = %namespace.name(), peer = %peer, "New connection");

        let idle = Arc::new(IdleTracker::new(session_timeout));
        let handlers =
            ShroudServerHandlers::for_connection(manager.clone(), namespace.clone(), peer, idle.clone());

        tokio::spawn(async move {
            tokio::select! {
                result = pgwire::tokio::process_socket(socket, None, handlers) => {
                    if let Err(e) = result {
                        tracing::error!(peer = %peer, error = ?e, "Connection error");
                    }
                }
                _ = idle.expired() => {
                    tracing::info!(namespace = %namespace.name(), peer = %peer, "Session idle timeout");
                }
            }
            tracing::info!(namespace = %namespace.name(), peer = %peer, "Session ended");
        });
    }
}
