//! SQL parsing and relation analysis.

use crate::error::MaskError;
use sqlparser::ast::{Ident, ObjectName, ObjectNamePart, Statement, visit_relations, visit_relations_mut};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

/// Keywords Postgres refuses as bare identifiers.
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both",
    "case", "cast", "check", "collate", "column", "constraint", "create", "current_catalog",
    "current_date", "current_role", "current_time", "current_timestamp", "current_user",
    "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false",
    "fetch", "for", "foreign", "from", "grant", "group", "having", "in", "initially",
    "intersect", "into", "lateral", "leading", "limit", "localtime", "localtimestamp", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references",
    "returning", "select", "session_user", "some", "symmetric", "system_user", "table", "then",
    "to", "trailing", "true", "union", "unique", "user", "using", "variadic", "when", "where",
    "window", "with",
];

/// Parses statements and answers questions about the relations they read.
#[derive(Debug)]
pub struct SqlAnalyzer {
    dialect: PostgreSqlDialect,
}

impl Clone for SqlAnalyzer {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl Default for SqlAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// What the proxy does with a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Explain,
    Other,
}

/// A relation named somewhere in a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReference {
    /// Schema qualifier, i.e. the logical database.
    pub database: Option<String>,
    pub name: String,
}

impl TableReference {
    pub fn is_system(&self) -> bool {
        match &self.database {
            Some(database) => is_system_schema(database),
            None => self.name.starts_with("pg_"),
        }
    }
}

impl SqlAnalyzer {
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    pub fn dialect(&self) -> &PostgreSqlDialect {
        &self.dialect
    }

    /// Parse a SQL string into statements.
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>, MaskError> {
        Parser::parse_sql(&self.dialect, sql).map_err(|e| MaskError::Parse(e.to_string()))
    }

    /// Parse a SQL string holding exactly one statement.
    pub fn parse_one(&self, sql: &str) -> Result<Statement, MaskError> {
        let mut statements = self.parse(sql)?;
        match statements.len() {
            1 => Ok(statements.remove(0)),
            0 => Err(MaskError::Parse("empty query".to_string())),
            n => Err(MaskError::unsupported(format!(
                "{n} statements in one query string"
            ))),
        }
    }

    pub fn classify(&self, stmt: &Statement) -> StatementKind {
        match stmt {
            Statement::Query(_) => StatementKind::Query,
            Statement::Explain { .. } => StatementKind::Explain,
            _ => StatementKind::Other,
        }
    }

    /// Every relation the statement names, CTE references included.
    pub fn extract_tables(&self, stmt: &Statement) -> Vec<TableReference> {
        let mut tables = Vec::new();
        let _ = visit_relations(stmt, |name: &ObjectName| {
            let mut parts = name_parts(name);
            if let Some(table) = parts.pop() {
                tables.push(TableReference {
                    database: parts.pop(),
                    name: table,
                });
            }
            ControlFlow::<()>::Continue(())
        });
        tables
    }

    /// Whether any relation outside the system catalogs is read.
    pub fn touches_user_tables(&self, stmt: &Statement) -> bool {
        self.extract_tables(stmt).iter().any(|t| !t.is_system())
    }

    /// Logical databases the statement reads from. Unqualified user tables
    /// count against `current`.
    pub fn referenced_databases(&self, stmt: &Statement, current: Option<&str>) -> BTreeSet<String> {
        self.extract_tables(stmt)
            .into_iter()
            .filter(|t| !t.is_system())
            .filter_map(|t| t.database.or_else(|| current.map(str::to_lowercase)))
            .collect()
    }

    /// Replace logical schema qualifiers with their physical names.
    ///
    /// `physical` is keyed by lowercase logical name. Returns the number of
    /// relations renamed.
    pub fn rewrite_databases(&self, stmt: &mut Statement, physical: &BTreeMap<String, String>) -> usize {
        let mut renamed = 0;
        let _ = visit_relations_mut(stmt, |name: &mut ObjectName| {
            if name.0.len() >= 2 {
                let index = name.0.len() - 2;
                if let ObjectNamePart::Identifier(schema) = &mut name.0[index] {
                    if let Some(target) = physical.get(&normalize(schema)) {
                        if !target.eq_ignore_ascii_case(&schema.value) {
                            *schema = ident(target);
                            renamed += 1;
                        }
                    }
                }
            }
            ControlFlow::<()>::Continue(())
        });
        renamed
    }
}

pub fn is_system_schema(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "information_schema" || name.starts_with("pg_")
}

/// Identifier value with Postgres folding: unquoted names are lowercased.
pub(crate) fn normalize(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

/// Build an identifier for `name`, quoting it only when Postgres needs it.
pub(crate) fn ident(name: &str) -> Ident {
    let mut chars = name.chars();
    let plain = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&name);
    if plain {
        Ident::new(name)
    } else {
        Ident::with_quote('"', name)
    }
}

pub(crate) fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(ident) => normalize(ident),
            #[allow(unreachable_patterns)]
            other => other.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> Statement {
        SqlAnalyzer::new().parse_one(sql).unwrap()
    }

    #[test]
    fn test_parse_one_rejects_batches() {
        let analyzer = SqlAnalyzer::new();
        assert!(analyzer.parse_one("SELECT 1").is_ok());
        assert!(matches!(
            analyzer.parse_one("SELECT 1; SELECT 2"),
            Err(MaskError::Unsupported { .. })
        ));
        assert!(matches!(analyzer.parse_one("SELEC 1"), Err(MaskError::Parse(_))));
    }

    #[test]
    fn test_classify() {
        let analyzer = SqlAnalyzer::new();
        assert_eq!(analyzer.classify(&parse("SELECT 1")), StatementKind::Query);
        assert_eq!(
            analyzer.classify(&parse("EXPLAIN SELECT * FROM t")),
            StatementKind::Explain
        );
        assert_eq!(
            analyzer.classify(&parse("DELETE FROM t WHERE id = 1")),
            StatementKind::Other
        );
    }

    #[test]
    fn test_extract_tables_from_join_and_subquery() {
        let analyzer = SqlAnalyzer::new();
        let stmt = parse(
            "SELECT c.id FROM shop.customer c JOIN orders o ON o.cid = c.id \
             WHERE c.id IN (SELECT cid FROM refunds)",
        );
        let tables = analyzer.extract_tables(&stmt);
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customer", "orders", "refunds"]);
        assert_eq!(tables[0].database.as_deref(), Some("shop"));
    }

    #[test]
    fn test_system_catalog_only() {
        let analyzer = SqlAnalyzer::new();
        assert!(!analyzer.touches_user_tables(&parse("SELECT version()")));
        assert!(!analyzer.touches_user_tables(&parse("SELECT * FROM pg_catalog.pg_class")));
        assert!(!analyzer.touches_user_tables(&parse("SELECT relname FROM pg_class")));
        assert!(!analyzer.touches_user_tables(&parse(
            "SELECT table_name FROM information_schema.tables"
        )));
        assert!(analyzer.touches_user_tables(&parse(
            "SELECT c.relname, u.id FROM pg_class c, users u"
        )));
    }

    #[test]
    fn test_referenced_databases() {
        let analyzer = SqlAnalyzer::new();
        let stmt = parse("SELECT * FROM customer, crm.contact, pg_class");
        let dbs: Vec<_> = analyzer
            .referenced_databases(&stmt, Some("Shop"))
            .into_iter()
            .collect();
        assert_eq!(dbs, vec!["crm".to_string(), "shop".to_string()]);
    }

    #[test]
    fn test_rewrite_databases() {
        let analyzer = SqlAnalyzer::new();
        let mut stmt = parse(
            "SELECT a.id FROM shop.customer AS a JOIN crm.contact AS b ON a.id = b.id",
        );
        let physical = BTreeMap::from([("shop".to_string(), "shop_0001".to_string())]);
        assert_eq!(analyzer.rewrite_databases(&mut stmt, &physical), 1);
        assert_eq!(
            stmt.to_string(),
            "SELECT a.id FROM shop_0001.customer AS a JOIN crm.contact AS b ON a.id = b.id"
        );
    }

    #[test]
    fn test_ident_quoting() {
        assert_eq!(ident("mobile").to_string(), "mobile");
        assert_eq!(ident("Mobile").to_string(), "\"Mobile\"");
        assert_eq!(ident("user").to_string(), "\"user\"");
        assert_eq!(ident("2fa").to_string(), "\"2fa\"");
    }
}
