//! Configuration types for the Shroud masking proxy.
//!
//! The proxy settings (`shroud.yaml`) are loaded once at startup. The tenant
//! configuration directory is loaded as a whole into a [`ConfigSet`] both at
//! startup and on every reload, then verified before any runtime structure is
//! built from it.

pub mod catalog;
pub mod namespace;
pub mod proxy;
pub mod rule;
pub mod white_list;

use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

pub use catalog::TableCatalogConfig;
pub use namespace::{BackendAddr, NamespaceConfig, SliceConfig, UserConfig};
pub use proxy::ProxyConfig;
pub use rule::{DatabaseBinding, MaskRuleConfig, RuleListConfig};
pub use white_list::{Exemption, WhiteListConfig, WhiteListRecordConfig};

/// Directory holding one namespace record per file.
pub const NAMESPACE_DIR: &str = "namespace";
/// Directory holding one whitelist per file.
pub const WHITE_LIST_DIR: &str = "white_list";
/// Directory holding one rule list per file.
pub const RULE_DIR: &str = "rule";
/// Database binding file.
pub const DATABASES_FILE: &str = "databases.yaml";
/// Table descriptor file.
pub const TABLES_FILE: &str = "tables.yaml";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    InFile {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("namespace {name}: {reason}")]
    Namespace { name: String, reason: String },

    #[error("duplicate namespace name {0}")]
    DuplicateNamespace(String),

    #[error("port {port} is used by both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
}

impl ConfigError {
    pub(crate) fn namespace(name: &str, reason: impl Into<String>) -> Self {
        Self::Namespace {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    fn in_file(path: &Path, source: ConfigError) -> Self {
        Self::InFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        }
    }
}

/// Every tenant record of one configuration directory.
#[derive(Debug, Clone, Default)]
pub struct ConfigSet {
    /// Namespaces keyed by name.
    pub namespaces: BTreeMap<String, NamespaceConfig>,
    /// Whitelists keyed by file stem.
    pub white_lists: BTreeMap<String, WhiteListConfig>,
    /// Rule lists keyed by file stem.
    pub rule_lists: BTreeMap<String, RuleListConfig>,
    /// Logical database bindings.
    pub databases: Vec<DatabaseBinding>,
    /// Table descriptors.
    pub tables: TableCatalogConfig,
}

impl ConfigSet {
    /// Load a configuration directory.
    ///
    /// Missing sub-directories and files are treated as empty. The result is
    /// not verified; call [`ConfigSet::verify`] before publishing it.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let mut set = ConfigSet::default();

        for path in yaml_files(&dir.join(NAMESPACE_DIR))? {
            let namespace = NamespaceConfig::from_file(&path)?;
            if set.namespaces.contains_key(&namespace.name) {
                return Err(ConfigError::in_file(
                    &path,
                    ConfigError::DuplicateNamespace(namespace.name),
                ));
            }
            set.namespaces.insert(namespace.name.clone(), namespace);
        }

        for path in yaml_files(&dir.join(WHITE_LIST_DIR))? {
            let name = file_stem(&path)?;
            let records = read_yaml(&path)?;
            set.white_lists
                .insert(name.clone(), WhiteListConfig { name, records });
        }

        for path in yaml_files(&dir.join(RULE_DIR))? {
            let name = file_stem(&path)?;
            let rules = read_yaml(&path)?;
            set.rule_lists.insert(name.clone(), RuleListConfig { name, rules });
        }

        let databases = dir.join(DATABASES_FILE);
        if databases.is_file() {
            set.databases = read_yaml(&databases)?;
        }

        let tables = dir.join(TABLES_FILE);
        if tables.is_file() {
            set.tables = read_yaml(&tables)?;
        }

        tracing::debug!(
            dir = %dir.display(),
            namespaces = set.namespaces.len(),
            white_lists = set.white_lists.len(),
            rule_lists = set.rule_lists.len(),
            "Loaded configuration directory"
        );

        Ok(set)
    }

    /// Verify every record and the cross-record constraints.
    pub fn verify(&self) -> Result<(), ConfigError> {
        let mut ports: HashMap<u16, &str> = HashMap::new();
        for namespace in self.namespaces.values() {
            namespace.verify()?;
            if let Some(first) = ports.insert(namespace.proxy_port, &namespace.name) {
                return Err(ConfigError::DuplicatePort {
                    port: namespace.proxy_port,
                    first: first.to_string(),
                    second: namespace.name.clone(),
                });
            }
        }

        for white_list in self.white_lists.values() {
            white_list.verify()?;
        }
        for rule_list in self.rule_lists.values() {
            rule_list.verify()?;
        }

        let mut bound = HashSet::new();
        for binding in &self.databases {
            if binding.database.is_empty() {
                return Err(ConfigError::Config(
                    "database binding without a database name".to_string(),
                ));
            }
            if !bound.insert(binding.database.as_str()) {
                return Err(ConfigError::Config(format!(
                    "database {} is bound more than once",
                    binding.database
                )));
            }
            if let Some(rule) = &binding.rule {
                if !self.rule_lists.contains_key(rule) {
                    return Err(ConfigError::Config(format!(
                        "database {} references unknown rule list {rule}",
                        binding.database
                    )));
                }
            }
            if let Some(white_list) = &binding.white_list {
                if !self.white_lists.contains_key(white_list) {
                    return Err(ConfigError::Config(format!(
                        "database {} references unknown whitelist {white_list}",
                        binding.database
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Parse one YAML file, tagging any failure with its path.
pub(crate) fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::in_file(path, e.into()))?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::in_file(path, e.into()))
}

/// All `.yaml`/`.yml` files of a directory in path order. A missing
/// directory yields nothing.
fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> Result<String, ConfigError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Config(format!("invalid file name {}", path.display())))
}
