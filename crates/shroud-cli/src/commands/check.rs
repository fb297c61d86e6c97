//! `shroud check`: load and verify a configuration directory.
//!
//! Verification failures are errors; the proxy refuses to load such a
//! directory. Warnings flag configurations that load but probably do not do
//! what was meant, such as a rule on a column the table catalog lacks.

use chrono::Local;
use shroud_core::{ConfigSet, TableCatalogConfig};
use shroud_proxy::RuleManager;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    pub category: &'static str,
    pub message: String,
}

impl CheckFinding {
    fn error(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            message: message.into(),
        }
    }

    fn warning(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            message: message.into(),
        }
    }
}

/// Findings and the loaded directory, if it loaded.
#[derive(Debug, Default)]
pub struct CheckResults {
    pub findings: Vec<CheckFinding>,
    pub set: Option<ConfigSet>,
}

impl CheckResults {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    pub fn print_summary(&self) {
        if let Some(set) = &self.set {
            println!("Namespaces ({}):", set.namespaces.len());
            for namespace in set.namespaces.values() {
                println!(
                    "  {:<20} port {:<6} databases [{}]  users {}  backends {}",
                    namespace.name,
                    namespace.proxy_port,
                    namespace.allowed_dbs.join(", "),
                    namespace.users.len(),
                    namespace.slice.master.iter().count() + namespace.slice.slaves.len(),
                );
            }
            println!("Rule lists: {}", set.rule_lists.len());
            println!("Whitelists: {}", set.white_lists.len());
            println!("Database bindings: {}", set.databases.len());
            println!("Catalog databases: {}", set.tables.databases().count());
        }

        let mut findings: Vec<_> = self.findings.iter().collect();
        findings.sort_by(|a, b| (a.severity, a.category).cmp(&(b.severity, b.category)));
        if !findings.is_empty() {
            println!();
        }
        for finding in findings {
            let icon = match finding.severity {
                Severity::Error => "✗",
                Severity::Warning => "⚠",
            };
            println!("  {icon} [{}] {}", finding.category, finding.message);
        }

        println!();
        println!("{}", "═".repeat(60));
        if self.findings.is_empty() {
            println!("All checks passed.");
        } else {
            println!(
                "Summary: {} error(s), {} warning(s)",
                self.count(Severity::Error),
                self.count(Severity::Warning)
            );
        }
    }
}

/// Run every check against `dir`.
pub fn check_dir(dir: &Path) -> CheckResults {
    let mut results = CheckResults::default();

    let set = match ConfigSet::load_dir(dir) {
        Ok(set) => set,
        Err(e) => {
            results.findings.push(CheckFinding::error("load", e.to_string()));
            return results;
        }
    };
    if let Err(e) = set.verify() {
        results.findings.push(CheckFinding::error("verify", e.to_string()));
    }
    if let Err(e) = RuleManager::new(set.rule_lists.values()) {
        results.findings.push(CheckFinding::error("verify", e.to_string()));
    }

    results.findings.extend(check_bindings(&set));
    results.findings.extend(check_rules(&set));
    results.findings.extend(check_white_lists(&set));
    results.set = Some(set);
    results
}

pub fn run_check(dir: &Path) -> anyhow::Result<()> {
    println!("Checking {}", dir.display());
    println!();

    let results = check_dir(dir);
    results.print_summary();
    if results.has_errors() {
        anyhow::bail!("configuration has {} error(s)", results.count(Severity::Error));
    }
    Ok(())
}

/// Allowed databases without mask rules or without table descriptors.
fn check_bindings(set: &ConfigSet) -> Vec<CheckFinding> {
    let mut findings = Vec::new();
    for namespace in set.namespaces.values() {
        for db in &namespace.allowed_dbs {
            let bound = set
                .databases
                .iter()
                .any(|b| b.database.eq_ignore_ascii_case(db) && b.rule.is_some());
            if !bound {
                findings.push(CheckFinding::warning(
                    "binding",
                    format!("namespace {}: database {db} has no mask rules", namespace.name),
                ));
            }
            if !has_database(&set.tables, db) {
                findings.push(CheckFinding::warning(
                    "catalog",
                    format!(
                        "namespace {}: database {db} is missing from tables.yaml, queries on its tables will be rejected",
                        namespace.name
                    ),
                ));
            }
        }
    }
    findings
}

/// Rules whose column the table catalog does not know never match.
fn check_rules(set: &ConfigSet) -> Vec<CheckFinding> {
    let mut findings = Vec::new();
    for binding in &set.databases {
        let Some(rules) = binding
            .rule
            .as_ref()
            .and_then(|name| set.rule_lists.get(name))
        else {
            continue;
        };
        for rule in &rules.rules {
            let known = set
                .tables
                .columns(&binding.database, &rule.table)
                .is_some_and(|columns| columns.iter().any(|c| c.eq_ignore_ascii_case(&rule.column)));
            if !known {
                findings.push(CheckFinding::warning(
                    "rule",
                    format!(
                        "rule {} of {}: column {}.{}.{} is not in tables.yaml",
                        rule.name, rules.name, binding.database, rule.table, rule.column
                    ),
                ));
            }
        }
    }
    findings
}

fn check_white_lists(set: &ConfigSet) -> Vec<CheckFinding> {
    let now = Local::now();
    let mut findings = Vec::new();
    for white_list in set.white_lists.values() {
        for record in &white_list.records {
            if let Ok((_, to)) = record.window() {
                if to <= now {
                    findings.push(CheckFinding::warning(
                        "white_list",
                        format!(
                            "whitelist {}: record of {} expired at {}",
                            white_list.name, record.user, record.to_time
                        ),
                    ));
                }
            }
        }
    }
    findings
}

fn has_database(tables: &TableCatalogConfig, db: &str) -> bool {
    tables.databases().any(|d| d.eq_ignore_ascii_case(db))
}
