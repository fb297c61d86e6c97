//! Per-generation lookup tables.
//!
//! Every registry is immutable once built. Changing one means building a
//! new registry, usually by copying the unaffected entries of the old one.

use crate::error::ProxyError;
use crate::namespace::Namespace;
use chrono::{DateTime, Local};
use shroud_core::{
    ConfigError, DatabaseBinding, Exemption, IpAllowList, MaskRuleConfig, NamespaceConfig,
    RuleListConfig, TableCatalogConfig, WhiteListConfig,
};
use shroud_mask::validate_mask_function;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

/// Namespaces by name and by listen port.
#[derive(Debug, Clone, Default)]
pub struct NamespaceManager {
    namespaces: BTreeMap<String, Arc<Namespace>>,
    ports: BTreeMap<u16, String>,
}

impl NamespaceManager {
    /// Index namespaces, rejecting duplicate names and ports.
    pub fn new(namespaces: impl IntoIterator<Item = Arc<Namespace>>) -> Result<Self, ProxyError> {
        let mut manager = Self::default();
        for namespace in namespaces {
            manager.check_port(&namespace)?;
            if manager.namespaces.contains_key(namespace.name()) {
                return Err(ConfigError::DuplicateNamespace(namespace.name().to_string()).into());
            }
            manager.insert(namespace);
        }
        Ok(manager)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Namespace>> {
        self.namespaces.get(name)
    }

    pub fn by_port(&self, port: u16) -> Option<&Arc<Namespace>> {
        self.ports.get(&port).and_then(|name| self.namespaces.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Namespace>> {
        self.namespaces.values()
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Copy with `namespace` added or replacing the namespace of the same
    /// name. Fails when another namespace already uses its port.
    pub fn with_namespace(&self, namespace: Arc<Namespace>) -> Result<Self, ProxyError> {
        let mut manager = self.without_namespace(namespace.name());
        manager.check_port(&namespace)?;
        manager.insert(namespace);
        Ok(manager)
    }

    pub fn without_namespace(&self, name: &str) -> Self {
        let mut manager = self.clone();
        if let Some(old) = manager.namespaces.remove(name) {
            manager.ports.remove(&old.port());
        }
        manager
    }

    /// Fail if `port` is used by a namespace other than `name`.
    pub fn check_port_free(&self, name: &str, port: u16) -> Result<(), ConfigError> {
        match self.ports.get(&port) {
            Some(owner) if owner != name => Err(ConfigError::DuplicatePort {
                port,
                first: owner.clone(),
                second: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn check_port(&self, namespace: &Namespace) -> Result<(), ConfigError> {
        self.check_port_free(namespace.name(), namespace.port())
    }

    fn insert(&mut self, namespace: Arc<Namespace>) {
        self.ports
            .insert(namespace.port(), namespace.name().to_string());
        self.namespaces
            .insert(namespace.name().to_string(), namespace);
    }
}

/// Users and passwords, per namespace.
#[derive(Debug, Clone, Default)]
pub struct UserManager {
    users: BTreeMap<String, HashMap<String, Vec<String>>>,
}

impl UserManager {
    pub fn new<'a>(namespaces: impl IntoIterator<Item = &'a NamespaceConfig>) -> Self {
        let mut manager = Self::default();
        for config in namespaces {
            manager.index(config);
        }
        manager
    }

    /// Copy with the users of `config` replacing those of its namespace.
    pub fn with_namespace(&self, config: &NamespaceConfig) -> Self {
        let mut manager = self.clone();
        manager.index(config);
        manager
    }

    pub fn without_namespace(&self, name: &str) -> Self {
        let mut manager = self.clone();
        manager.users.remove(name);
        manager
    }

    /// Whether `password` is one of the user's passwords in `namespace`.
    pub fn authenticate(&self, namespace: &str, user: &str, password: &str) -> bool {
        self.users
            .get(namespace)
            .and_then(|users| users.get(user))
            .is_some_and(|passwords| passwords.iter().any(|p| p == password))
    }

    /// Namespaces that know `user`.
    pub fn namespaces_of(&self, user: &str) -> Vec<&str> {
        self.users
            .iter()
            .filter(|(_, users)| users.contains_key(user))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn index(&mut self, config: &NamespaceConfig) {
        let users = config
            .users
            .iter()
            .map(|u| (u.user_name.clone(), u.passwords.clone()))
            .collect();
        self.users.insert(config.name.clone(), users);
    }
}

/// A whitelist record ready for matching.
#[derive(Debug, Clone)]
pub struct WhiteListRecord {
    pub user: String,
    pub from: DateTime<Local>,
    pub to: DateTime<Local>,
    pub ips: IpAllowList,
    pub exemption: Exemption,
}

impl WhiteListRecord {
    /// Whether the record applies to `user` connecting from `ip` at `now`.
    pub fn applies(&self, user: &str, ip: Option<IpAddr>, now: DateTime<Local>) -> bool {
        self.user == user
            && self.from <= now
            && now < self.to
            && (self.ips.is_empty() || ip.is_some_and(|ip| self.ips.allows(ip)))
    }
}

/// Whitelists by name.
#[derive(Debug, Clone, Default)]
pub struct WhiteListManager {
    lists: HashMap<String, Arc<[WhiteListRecord]>>,
}

impl WhiteListManager {
    pub fn new<'a>(lists: impl IntoIterator<Item = &'a WhiteListConfig>) -> Result<Self, ProxyError> {
        let mut manager = Self::default();
        for list in lists {
            let records = list
                .records
                .iter()
                .map(|record| {
                    let (from, to) = record.window()?;
                    Ok(WhiteListRecord {
                        user: record.user.clone(),
                        from,
                        to,
                        ips: IpAllowList::parse(&record.ip_list)?,
                        exemption: record.exemption(),
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
            manager.lists.insert(list.name.clone(), records.into());
        }
        Ok(manager)
    }

    /// Exemption of the first record of `list` that applies right now.
    pub fn active(
        &self,
        list: &str,
        user: &str,
        ip: Option<IpAddr>,
        now: DateTime<Local>,
    ) -> Option<&Exemption> {
        self.lists
            .get(list)?
            .iter()
            .find(|record| record.applies(user, ip, now))
            .map(|record| &record.exemption)
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

/// Mask rule lists by name.
#[derive(Debug, Clone, Default)]
pub struct RuleManager {
    lists: HashMap<String, Arc<[MaskRuleConfig]>>,
}

impl RuleManager {
    /// Index rule lists, rejecting mask functions that cannot wrap a column.
    pub fn new<'a>(lists: impl IntoIterator<Item = &'a RuleListConfig>) -> Result<Self, ProxyError> {
        let mut manager = Self::default();
        for list in lists {
            for rule in &list.rules {
                validate_mask_function(&rule.function).map_err(|e| {
                    ConfigError::Config(format!("rule list {} rule {}: {e}", list.name, rule.name))
                })?;
            }
            manager
                .lists
                .insert(list.name.clone(), list.rules.clone().into());
        }
        Ok(manager)
    }

    pub fn get(&self, name: &str) -> Option<&[MaskRuleConfig]> {
        self.lists.get(name).map(|rules| &rules[..])
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

/// Logical database bindings and table descriptors.
#[derive(Debug, Clone, Default)]
pub struct DBManager {
    bindings: HashMap<String, DatabaseBinding>,
    catalog: TableCatalogConfig,
}

impl DBManager {
    pub fn new(bindings: &[DatabaseBinding], catalog: TableCatalogConfig) -> Self {
        Self {
            bindings: bindings
                .iter()
                .map(|b| (b.database.to_lowercase(), b.clone()))
                .collect(),
            catalog,
        }
    }

    pub fn binding(&self, database: &str) -> Option<&DatabaseBinding> {
        self.bindings.get(&database.to_lowercase())
    }

    pub fn catalog(&self) -> &TableCatalogConfig {
        &self.catalog
    }
}
