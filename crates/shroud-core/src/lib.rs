//! # shroud-core
//!
//! Configuration model shared by every Shroud crate.
//!
//! A Shroud deployment is described by one proxy settings file (`shroud.yaml`)
//! and one configuration directory holding the tenant records:
//!
//! ```text
//! conf/
//! ├── namespace/*.yaml      one tenant per file
//! ├── white_list/<name>.yaml time-boxed mask exemptions
//! ├── rule/<name>.yaml       mask rules
//! ├── databases.yaml         logical database -> rule list / whitelist
//! └── tables.yaml            table descriptors (ordered columns)
//! ```
//!
//! Everything here is plain data plus verification. Runtime registries are
//! built from a verified [`ConfigSet`](config::ConfigSet) by `shroud-proxy`.

pub mod config;
pub mod net;

pub use config::{
    BackendAddr, ConfigError, ConfigSet, DatabaseBinding, Exemption, MaskRuleConfig,
    NamespaceConfig, ProxyConfig, RuleListConfig, SliceConfig, TableCatalogConfig, UserConfig,
    WhiteListConfig, WhiteListRecordConfig,
};
pub use net::{IpAllowList, IpPattern};
