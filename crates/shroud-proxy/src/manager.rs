//! Double-buffered configuration generations.
//!
//! The [`Manager`] owns two generation slots and an epoch counter; the slot
//! at `epoch % 2` is current. A prepare builds a replacement generation and
//! writes it into the other slot, which no reader looks at. A commit bumps
//! the epoch, after which every reader sees the replacement, and schedules
//! the namespaces that fell out of it for a graceful close.
//!
//! ```text
//!            prepare                 commit
//! Idle ───────────────▶ Staged ───────────────▶ Idle
//!  ▲  slot[e%2] serves   slot[(e+1)%2] holds     epoch = e+1, retired
//!  │                     the replacement         namespaces drain
//!  └────────────────────────────────────────────────────┘
//! ```

use crate::error::ProxyError;
use crate::namespace::Namespace;
use crate::registry::{DBManager, NamespaceManager, RuleManager, UserManager, WhiteListManager};
use parking_lot::{Mutex, RwLock};
use shroud_backend::PoolFactory;
use shroud_core::{ConfigSet, NamespaceConfig, ProxyConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Settings applied to every generation the manager builds.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Bounded wait for a backend connection.
    pub acquire_timeout: Duration,
    /// How long a retired namespace waits for its sessions before closing.
    pub close_grace: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            acquire_timeout: config.acquire_timeout(),
            close_grace: config.close_grace(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// One coherent snapshot of every registry.
#[derive(Debug)]
pub struct Generation {
    pub epoch: u64,
    pub namespaces: Arc<NamespaceManager>,
    pub users: Arc<UserManager>,
    pub white_lists: Arc<WhiteListManager>,
    pub rules: Arc<RuleManager>,
    pub databases: Arc<DBManager>,
}

impl Generation {
    /// Verify `set` and build every registry from it.
    pub fn build(
        set: &ConfigSet,
        factory: &dyn PoolFactory,
        settings: &ManagerSettings,
        epoch: u64,
    ) -> Result<Self, ProxyError> {
        set.verify()?;
        let namespaces = set
            .namespaces
            .values()
            .map(|config| {
                Namespace::build(config, factory, settings.acquire_timeout).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            epoch,
            namespaces: Arc::new(NamespaceManager::new(namespaces)?),
            users: Arc::new(UserManager::new(set.namespaces.values())),
            white_lists: Arc::new(WhiteListManager::new(set.white_lists.values())?),
            rules: Arc::new(RuleManager::new(set.rule_lists.values())?),
            databases: Arc::new(DBManager::new(&set.databases, set.tables.clone())),
        })
    }

    fn with_registries(
        &self,
        epoch: u64,
        namespaces: NamespaceManager,
        users: UserManager,
    ) -> Self {
        Self {
            epoch,
            namespaces: Arc::new(namespaces),
            users: Arc::new(users),
            white_lists: self.white_lists.clone(),
            rules: self.rules.clone(),
            databases: self.databases.clone(),
        }
    }
}

struct Staged {
    generation: Arc<Generation>,
    /// Namespaces no longer reachable once `generation` is committed.
    retiring: Vec<Arc<Namespace>>,
}

/// Holds the current generation and runs the two-phase reload protocol.
pub struct Manager {
    epoch: AtomicU64,
    slots: [RwLock<Arc<Generation>>; 2],
    /// Serializes prepares and commits; `Some` while a generation is staged.
    staged: Mutex<Option<Staged>>,
    factory: Arc<dyn PoolFactory>,
    settings: ManagerSettings,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("epoch", &self.epoch.load(Ordering::Acquire))
            .field("staged", &self.is_staged())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Manager {
    /// Build the first generation from `set` and publish it.
    pub fn new(
        set: &ConfigSet,
        factory: Arc<dyn PoolFactory>,
        settings: ManagerSettings,
    ) -> Result<Self, ProxyError> {
        let generation = Arc::new(Generation::build(set, factory.as_ref(), &settings, 0)?);
        tracing::info!(
            namespaces = generation.namespaces.len(),
            rule_lists = generation.rules.len(),
            white_lists = generation.white_lists.len(),
            "Published initial generation"
        );
        Ok(Self {
            epoch: AtomicU64::new(0),
            slots: [RwLock::new(generation.clone()), RwLock::new(generation)],
            staged: Mutex::new(None),
            factory,
            settings,
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// The current generation.
    pub fn current(&self) -> Arc<Generation> {
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let generation = self.slots[slot(epoch)].read().clone();
            // A slot read across a commit may hold a newer staged generation.
            if self.epoch.load(Ordering::Acquire) == epoch {
                return generation;
            }
        }
    }

    pub fn namespace_by_port(&self, port: u16) -> Option<Arc<Namespace>> {
        self.current().namespaces.by_port(port).cloned()
    }

    pub fn is_staged(&self) -> bool {
        self.staged.lock().is_some()
    }

    /// Stage a generation where `config` replaces (or adds) one namespace.
    ///
    /// Builds on the staged generation when one exists, so consecutive
    /// prepares accumulate. On failure nothing is written.
    pub fn prepare_namespace(&self, config: &NamespaceConfig) -> Result<(), ProxyError> {
        config.verify()?;
        let mut staged = self.staged.lock();
        let (base, mut retiring) = self.base(&staged);

        base.namespaces
            .check_port_free(&config.name, config.proxy_port)?;
        let namespace = Arc::new(Namespace::build(
            config,
            self.factory.as_ref(),
            self.settings.acquire_timeout,
        )?);
        let namespaces = base.namespaces.with_namespace(namespace)?;
        let users = base.users.with_namespace(config);

        if let Some(old) = base.namespaces.get(&config.name) {
            retiring.push(old.clone());
        }
        let generation = base.with_registries(self.next_epoch(), namespaces, users);
        self.stage(&mut staged, generation, retiring);
        tracing::info!(namespace = %config.name, port = config.proxy_port, "Prepared namespace");
        Ok(())
    }

    /// Publish the staged generation.
    pub fn commit(&self, name: &str) -> Result<(), ProxyError> {
        let mut staged = self.staged.lock();
        let Staged {
            generation,
            retiring,
        } = staged.take().ok_or(ProxyError::NothingStaged)?;

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        // The retired slot becomes a copy of the current one.
        *self.slots[slot(epoch + 1)].write() = generation.clone();
        tracing::info!(name, epoch, retiring = retiring.len(), "Committed generation");
        drop(staged);

        self.retire(retiring);
        Ok(())
    }

    /// Stage a generation with `name` removed. Returns `false`, staging
    /// nothing, when no such namespace exists.
    pub fn prepare_delete(&self, name: &str) -> Result<bool, ProxyError> {
        let mut staged = self.staged.lock();
        let (base, mut retiring) = self.base(&staged);
        let Some(old) = base.namespaces.get(name).cloned() else {
            return Ok(false);
        };

        let namespaces = base.namespaces.without_namespace(name);
        let users = base.users.without_namespace(name);
        retiring.push(old);
        let generation = base.with_registries(self.next_epoch(), namespaces, users);
        self.stage(&mut staged, generation, retiring);
        tracing::info!(namespace = %name, "Prepared namespace removal");
        Ok(true)
    }

    /// Remove a namespace. Idempotent.
    pub fn delete_namespace(&self, name: &str) -> Result<(), ProxyError> {
        if self.prepare_delete(name)? {
            self.commit(name)?;
        }
        Ok(())
    }

    /// Stage a generation built wholesale from `set`. Every namespace of
    /// the base generation is retired on commit.
    pub fn reload_all_prepare(&self, set: &ConfigSet) -> Result<(), ProxyError> {
        let mut staged = self.staged.lock();
        let generation = Generation::build(
            set,
            self.factory.as_ref(),
            &self.settings,
            self.next_epoch(),
        )
        .inspect_err(|e| tracing::warn!(error = %e, "Reload prepare failed"))?;

        let (base, mut retiring) = self.base(&staged);
        retiring.extend(base.namespaces.iter().cloned());
        self.stage(&mut staged, generation, retiring);
        tracing::info!(namespaces = set.namespaces.len(), "Prepared full reload");
        Ok(())
    }

    pub fn reload_all_commit(&self) -> Result<(), ProxyError> {
        self.commit("*")
    }

    /// The generation a prepare builds on and the namespaces already
    /// scheduled for retirement.
    fn base(&self, staged: &Option<Staged>) -> (Arc<Generation>, Vec<Arc<Namespace>>) {
        match staged {
            Some(staged) => (staged.generation.clone(), staged.retiring.clone()),
            None => (self.current(), Vec::new()),
        }
    }

    fn stage(&self, staged: &mut Option<Staged>, generation: Generation, retiring: Vec<Arc<Namespace>>) {
        let generation = Arc::new(generation);
        *self.slots[slot(self.next_epoch())].write() = generation.clone();
        *staged = Some(Staged {
            generation,
            retiring,
        });
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire) + 1
    }

    /// Close retired namespaces once their sessions are gone or the grace
    /// period ends.
    fn retire(&self, retiring: Vec<Arc<Namespace>>) {
        if retiring.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(count = retiring.len(), "No runtime to close retired namespaces on");
            return;
        };
        let grace = self.settings.close_grace;
        for namespace in retiring {
            runtime.spawn(async move {
                let deadline = tokio::time::Instant::now() + grace;
                while Arc::strong_count(&namespace) > 1 && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
                let sessions = Arc::strong_count(&namespace) - 1;
                namespace.close().await;
                tracing::info!(namespace = %namespace.name(), sessions, "Retired namespace");
            });
        }
    }
}

fn slot(epoch: u64) -> usize {
    (epoch % 2) as usize
}
