//! Mask rules and database bindings.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A named rule list (`rule/<name>.yaml`, a list of rules).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleListConfig {
    pub name: String,
    pub rules: Vec<MaskRuleConfig>,
}

impl RuleListConfig {
    pub fn verify(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.is_empty()
                || rule.table.is_empty()
                || rule.column.is_empty()
                || rule.function.is_empty()
            {
                return Err(ConfigError::Config(format!(
                    "rule list {}: every rule needs name, table, column and function",
                    self.name
                )));
            }
            if rule.name == "*" {
                return Err(ConfigError::Config(format!(
                    "rule list {}: \"*\" is reserved",
                    self.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::Config(format!(
                    "rule list {}: duplicate rule {}",
                    self.name, rule.name
                )));
            }
        }
        Ok(())
    }
}

/// Mask `table.column` with `function` on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskRuleConfig {
    pub name: String,
    pub table: String,
    pub column: String,
    /// SQL function name, used verbatim.
    pub function: String,
}

/// Which rule list and whitelist apply to a logical database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseBinding {
    pub database: String,

    #[serde(default)]
    pub rule: Option<String>,

    #[serde(default)]
    pub white_list: Option<String>,
}
