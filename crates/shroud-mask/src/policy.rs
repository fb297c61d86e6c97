//! Mask rules in effect for one statement.

use crate::lineage::ColumnOrigin;
use serde::Serialize;
use shroud_core::{Exemption, MaskRuleConfig};
use std::collections::HashMap;

/// A mask rule bound to a logical database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaskRule {
    pub name: String,
    pub database: String,
    pub table: String,
    pub column: String,
    pub function: String,
}

impl MaskRule {
    pub fn from_config(database: &str, rule: &MaskRuleConfig) -> Self {
        Self {
            name: rule.name.clone(),
            database: database.to_string(),
            table: rule.table.clone(),
            column: rule.column.clone(),
            function: rule.function.clone(),
        }
    }
}

type RuleKey = (String, String, String);

/// Rules keyed by `(database, table, column)`, compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct MaskPolicy {
    rules: HashMap<RuleKey, MaskRule>,
}

impl MaskPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the rules of one database, leaving out what the exemption names.
    pub fn extend<'r>(
        &mut self,
        rules: impl IntoIterator<Item = &'r MaskRule>,
        exemption: Option<&Exemption>,
    ) {
        if matches!(exemption, Some(Exemption::All)) {
            return;
        }
        for rule in rules {
            if exemption.is_some_and(|e| e.exempts(&rule.name)) {
                tracing::debug!(rule = %rule.name, database = %rule.database, "Mask rule exempted");
                continue;
            }
            let key = key(&rule.database, &rule.table, &rule.column);
            if let Some(existing) = self.rules.get(&key) {
                tracing::warn!(
                    kept = %existing.name,
                    ignored = %rule.name,
                    "Two mask rules for one column"
                );
                continue;
            }
            self.rules.insert(key, rule.clone());
        }
    }

    pub fn lookup(&self, origin: &ColumnOrigin) -> Option<&MaskRule> {
        self.rules
            .get(&key(&origin.database, &origin.table, &origin.column))
    }

    /// First rule matching any of `origins`.
    pub fn lookup_any(&self, origins: &[ColumnOrigin]) -> Option<&MaskRule> {
        origins.iter().find_map(|o| self.lookup(o))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn key(database: &str, table: &str, column: &str) -> RuleKey {
    (
        database.to_lowercase(),
        table.to_lowercase(),
        column.to_lowercase(),
    )
}
