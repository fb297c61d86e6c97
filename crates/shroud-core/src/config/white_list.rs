//! Time-boxed mask exemptions.

use super::ConfigError;
use crate::net::IpAllowList;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wall-clock format of `from_time` / `to_time`.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A named whitelist (`white_list/<name>.yaml`, a list of records).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhiteListConfig {
    pub name: String,
    pub records: Vec<WhiteListRecordConfig>,
}

impl WhiteListConfig {
    pub fn verify(&self) -> Result<(), ConfigError> {
        for record in &self.records {
            record.verify().map_err(|e| {
                ConfigError::Config(format!("whitelist {}: {e}", self.name))
            })?;
        }
        Ok(())
    }
}

/// One exemption of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhiteListRecordConfig {
    /// Client IPs or CIDR blocks the exemption is limited to. Empty means any.
    #[serde(default)]
    pub ip_list: Vec<String>,

    pub user: String,

    /// Start of the window, inclusive, local time.
    pub from_time: String,

    /// End of the window, exclusive, local time.
    pub to_time: String,

    /// `;`-delimited rule names, or `*`.
    pub rules: String,
}

impl WhiteListRecordConfig {
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.user.is_empty() {
            return Err(ConfigError::Config("whitelist record without user".to_string()));
        }
        let (from, to) = self.window()?;
        if from >= to {
            return Err(ConfigError::Config(format!(
                "whitelist record of {}: from_time must be before to_time",
                self.user
            )));
        }
        if self.exemption().is_empty() {
            return Err(ConfigError::Config(format!(
                "whitelist record of {} exempts no rule",
                self.user
            )));
        }
        IpAllowList::parse(&self.ip_list)?;
        Ok(())
    }

    /// Validity window `[from, to)`.
    pub fn window(&self) -> Result<(DateTime<Local>, DateTime<Local>), ConfigError> {
        Ok((parse_local_time(&self.from_time)?, parse_local_time(&self.to_time)?))
    }

    pub fn exemption(&self) -> Exemption {
        Exemption::parse(&self.rules)
    }
}

fn parse_local_time(value: &str) -> Result<DateTime<Local>, ConfigError> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT)
        .map_err(|e| ConfigError::Config(format!("invalid time {value:?}: {e}")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ConfigError::Config(format!("time {value:?} does not exist locally")))
}

/// Rules a whitelist record exempts from masking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exemption {
    /// `*`: nothing is masked.
    All,
    /// Named rules only.
    Rules(BTreeSet<String>),
}

impl Exemption {
    /// Parse `"a;b"` or `"*"`. A `*` member anywhere in the list exempts all.
    pub fn parse(rules: &str) -> Self {
        let names: BTreeSet<String> = rules
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.contains("*") {
            Exemption::All
        } else {
            Exemption::Rules(names)
        }
    }

    pub fn exempts(&self, rule: &str) -> bool {
        match self {
            Exemption::All => true,
            Exemption::Rules(names) => names.contains(rule),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Exemption::Rules(names) if names.is_empty())
    }
}
