//! Runtime namespace: a tenant's routing and access limits.

use crate::error::ProxyError;
use regex::Regex;
use shroud_backend::{PoolFactory, Slice};
use shroud_core::{IpAllowList, NamespaceConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// A published namespace. Never modified once built; a configuration change
/// builds a new one.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    port: u16,
    allowed_dbs: BTreeSet<String>,
    /// Lowercase logical name to physical name.
    physical: BTreeMap<String, String>,
    slow_sql: Option<Duration>,
    black_sql: Vec<Regex>,
    allowed_ips: IpAllowList,
    slice: Arc<Slice>,
}

impl Namespace {
    /// Build a namespace and its slice. The configuration must already be
    /// verified.
    pub fn build(
        config: &NamespaceConfig,
        factory: &dyn PoolFactory,
        acquire_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let black_sql = config
            .black_sql
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("namespace {}: {e}", config.name))?;

        let physical = config
            .allowed_dbs
            .iter()
            .map(|db| (db.to_lowercase(), config.physical_db(db).to_string()))
            .collect();

        let slice = Slice::from_config(&config.slice, factory, acquire_timeout)?;

        Ok(Self {
            name: config.name.clone(),
            port: config.proxy_port,
            allowed_dbs: config.allowed_dbs.iter().map(|db| db.to_lowercase()).collect(),
            physical,
            slow_sql: config.slow_sql_threshold()?,
            black_sql,
            allowed_ips: IpAllowList::parse(&config.allowed_ip)?,
            slice: Arc::new(slice),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn slice(&self) -> &Arc<Slice> {
        &self.slice
    }

    pub fn is_allowed_db(&self, database: &str) -> bool {
        self.allowed_dbs.contains(&database.to_lowercase())
    }

    pub fn allowed_dbs(&self) -> impl Iterator<Item = &str> {
        self.allowed_dbs.iter().map(String::as_str)
    }

    /// Physical database (backend schema) of a logical one.
    pub fn physical_db(&self, logical: &str) -> String {
        self.physical
            .get(&logical.to_lowercase())
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }

    pub fn physical_map(&self) -> &BTreeMap<String, String> {
        &self.physical
    }

    pub fn slow_sql_threshold(&self) -> Option<Duration> {
        self.slow_sql
    }

    /// The first blacklist pattern matching `sql`.
    pub fn blacklisted(&self, sql: &str) -> Option<&str> {
        self.black_sql
            .iter()
            .find(|re| re.is_match(sql))
            .map(Regex::as_str)
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.allowed_ips.allows(ip)
    }

    pub async fn close(&self) {
        self.slice.close().await;
    }
}
