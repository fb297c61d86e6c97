//! Namespace (tenant) configuration.

use super::{ConfigError, read_yaml};
use crate::net::IpAllowList;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// One tenant: its databases, backend slice, users and access limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Unique namespace name.
    pub name: String,

    /// Port the namespace listens on. Unique across all namespaces.
    pub proxy_port: u16,

    /// Logical databases clients may select.
    #[serde(default)]
    pub allowed_dbs: Vec<String>,

    /// Logical to physical database names. Empty means identity.
    #[serde(default)]
    pub default_phy_dbs: BTreeMap<String, String>,

    /// Slow SQL threshold, integer milliseconds encoded as a string. "0"
    /// disables slow SQL logging.
    #[serde(default = "default_slow_sql_time")]
    pub slow_sql_time: String,

    /// Regular expressions of forbidden statements.
    #[serde(default)]
    pub black_sql: Vec<String>,

    /// Client IPs or CIDR blocks allowed to connect. Empty allows all.
    #[serde(default)]
    pub allowed_ip: Vec<String>,

    /// Backend slice the namespace routes through.
    pub slice: SliceConfig,

    /// Users of this namespace.
    #[serde(default)]
    pub users: Vec<UserConfig>,

    #[serde(default)]
    pub default_charset: Option<String>,

    #[serde(default)]
    pub default_collation: Option<String>,
}

impl NamespaceConfig {
    /// Load one namespace record.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_yaml(path.as_ref())
    }

    /// Parse one namespace record from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Check the record on its own. Cross-namespace constraints (unique
    /// names and ports) are checked by the caller.
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Config("namespace name must not be empty".to_string()));
        }
        let fail = |reason: String| ConfigError::namespace(&self.name, reason);

        if self.proxy_port == 0 {
            return Err(fail("proxy_port must be set".to_string()));
        }
        if self.allowed_dbs.is_empty() {
            return Err(fail("allowed_dbs must not be empty".to_string()));
        }

        if self.users.is_empty() {
            return Err(fail("at least one user is required".to_string()));
        }
        let mut seen = HashSet::new();
        for user in &self.users {
            user.verify().map_err(|e| fail(e.to_string()))?;
            if let Some(owner) = &user.namespace {
                if !owner.is_empty() && owner != &self.name {
                    return Err(fail(format!(
                        "user {} belongs to namespace {owner}",
                        user.user_name
                    )));
                }
            }
            if !seen.insert(user.user_name.as_str()) {
                return Err(fail(format!("duplicate user {}", user.user_name)));
            }
        }

        self.slow_sql_threshold()?;

        if !self.default_phy_dbs.is_empty() {
            for db in &self.allowed_dbs {
                if !self.default_phy_dbs.contains_key(db) {
                    return Err(fail(format!("allowed database {db} has no physical database")));
                }
            }
        }

        IpAllowList::parse(&self.allowed_ip).map_err(|e| fail(e.to_string()))?;

        for pattern in &self.black_sql {
            regex::Regex::new(pattern)
                .map_err(|e| fail(format!("invalid black_sql pattern {pattern:?}: {e}")))?;
        }

        self.slice.verify().map_err(|e| fail(e.to_string()))?;

        Ok(())
    }

    /// Parsed slow SQL threshold. `None` when disabled.
    pub fn slow_sql_threshold(&self) -> Result<Option<Duration>, ConfigError> {
        let millis: u64 = self.slow_sql_time.trim().parse().map_err(|_| {
            ConfigError::namespace(
                &self.name,
                format!("slow_sql_time {:?} is not a non-negative integer", self.slow_sql_time),
            )
        })?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }

    /// Physical database for a logical one.
    pub fn physical_db<'a>(&'a self, logical: &'a str) -> &'a str {
        self.default_phy_dbs
            .get(logical)
            .map(String::as_str)
            .unwrap_or(logical)
    }
}

fn default_slow_sql_time() -> String {
    "0".to_string()
}

/// A proxy user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_name: String,

    /// Valid passwords. Accepts a single `password` string as well.
    #[serde(alias = "password", deserialize_with = "one_or_many")]
    pub passwords: Vec<String>,

    /// Owning namespace. Empty means the namespace the record is listed in.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl UserConfig {
    fn verify(&self) -> Result<(), ConfigError> {
        if self.user_name.is_empty() {
            return Err(ConfigError::Config("user name must not be empty".to_string()));
        }
        if self.passwords.is_empty() || self.passwords.iter().any(String::is_empty) {
            return Err(ConfigError::Config(format!(
                "user {} needs at least one non-empty password",
                self.user_name
            )));
        }
        Ok(())
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Backend slice: one master, weighted slaves and pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceConfig {
    #[serde(default = "default_slice_name")]
    pub name: String,

    /// Backend user.
    pub user_name: String,

    /// Backend password.
    #[serde(default)]
    pub password: String,

    /// Postgres database every backend connection opens. Logical databases
    /// of the namespace are schemas inside it.
    #[serde(default = "default_backend_database")]
    pub database: String,

    /// Master address, `host:port`.
    #[serde(default)]
    pub master: Option<String>,

    /// Slave addresses, `host:port` optionally suffixed with `@weight`.
    #[serde(default)]
    pub slaves: Vec<String>,

    /// Connections each pool keeps open.
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Upper bound of connections each pool may open.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,

    /// Seconds an idle pooled connection is kept.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl SliceConfig {
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.user_name.is_empty() {
            return Err(ConfigError::Config("slice user_name must not be empty".to_string()));
        }
        if self.slaves.is_empty() && self.master.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Config(format!(
                "slice {} needs a master or at least one slave",
                self.name
            )));
        }
        if self.capacity == 0 || self.max_capacity == 0 {
            return Err(ConfigError::Config(format!(
                "slice {}: capacity and max_capacity must be greater than 0",
                self.name
            )));
        }
        if self.max_capacity < self.capacity {
            return Err(ConfigError::Config(format!(
                "slice {}: max_capacity {} is below capacity {}",
                self.name, self.max_capacity, self.capacity
            )));
        }
        self.endpoints()?;
        Ok(())
    }

    /// Weighted backend addresses this slice balances over.
    ///
    /// Slaves when any are configured, otherwise the master with weight 1.
    pub fn endpoints(&self) -> Result<Vec<BackendAddr>, ConfigError> {
        if self.slaves.is_empty() {
            return match self.master.as_deref() {
                Some(master) if !master.is_empty() => {
                    let mut addr: BackendAddr = master.parse()?;
                    addr.weight = 1;
                    Ok(vec![addr])
                }
                _ => Ok(Vec::new()),
            };
        }
        self.slaves.iter().map(|s| s.parse()).collect()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn default_slice_name() -> String {
    "slice-0".to_string()
}

fn default_backend_database() -> String {
    "postgres".to_string()
}

fn default_capacity() -> u32 {
    12
}

fn default_max_capacity() -> u32 {
    24
}

fn default_idle_timeout() -> u64 {
    60
}

/// A parsed `host:port[@weight]` backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl FromStr for BackendAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| ConfigError::Config(format!("invalid backend address {s:?}: {reason}"));

        let (addr, weight) = match s.split_once('@') {
            Some((addr, weight)) => {
                let weight: u32 = weight
                    .trim()
                    .parse()
                    .map_err(|_| invalid("weight is not an integer"))?;
                if weight == 0 {
                    return Err(invalid("weight must be at least 1"));
                }
                (addr, weight)
            }
            None => (s, 1),
        };

        let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            weight,
        })
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
