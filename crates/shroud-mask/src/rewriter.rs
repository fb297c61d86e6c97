//! Mask rewriting.
//!
//! Every top-level `SELECT` branch of a query is resolved and each output
//! column whose origin has a rule is replaced by `FUNC(expr) AS name`, where
//! `name` is the column name the client would have seen. A wildcard is
//! expanded into its columns only when one of them needs a mask.

use crate::error::MaskError;
use crate::lineage::{FieldRelation, LineageResolver, ProjectionLineage, Provenance};
use crate::parser::ident;
use crate::policy::{MaskPolicy, MaskRule};
use serde::Serialize;
use sqlparser::ast::{Expr, Ident, Query, Select, SelectItem, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Outcome of rewriting one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteReport {
    /// Output lineage of the statement, masks applied.
    pub fields: Vec<FieldRelation>,
    /// Number of projection items wrapped in a mask function.
    pub masked: usize,
}

/// Applies a [`MaskPolicy`] to parsed statements.
pub struct MaskRewriter<'p> {
    policy: &'p MaskPolicy,
    dialect: PostgreSqlDialect,
}

impl<'p> MaskRewriter<'p> {
    pub fn new(policy: &'p MaskPolicy) -> Self {
        Self {
            policy,
            dialect: PostgreSqlDialect {},
        }
    }

    /// Rewrite `statement` in place. Statements other than queries are left
    /// alone.
    pub fn rewrite(
        &self,
        statement: &mut Statement,
        resolver: &mut LineageResolver<'_>,
    ) -> Result<RewriteReport, MaskError> {
        let mut report = RewriteReport::default();
        if let Statement::Query(query) = statement {
            self.rewrite_query(query, resolver, &mut report, true)?;
        }
        Ok(report)
    }

    fn rewrite_query(
        &self,
        query: &mut Query,
        resolver: &mut LineageResolver<'_>,
        report: &mut RewriteReport,
        record: bool,
    ) -> Result<(), MaskError> {
        resolver.enter_with(query)?;
        let result = self.rewrite_set_expr(&mut query.body, resolver, report, record);
        resolver.leave_with(query);
        result
    }

    fn rewrite_set_expr(
        &self,
        body: &mut SetExpr,
        resolver: &mut LineageResolver<'_>,
        report: &mut RewriteReport,
        record: bool,
    ) -> Result<(), MaskError> {
        match body {
            SetExpr::Select(select) => {
                let lineage = resolver.resolve_select(select)?;
                self.rewrite_select(select, lineage.items, report, record)
            }
            SetExpr::Query(query) => self.rewrite_query(query, resolver, report, record),
            SetExpr::SetOperation { left, right, .. } => {
                self.rewrite_set_expr(left, resolver, report, record)?;
                self.rewrite_set_expr(right, resolver, report, false)
            }
            SetExpr::Values(_) => {
                let fields = resolver.resolve_set_expr(body)?;
                for field in &fields {
                    if let Some(rule) = self.policy.lookup_any(field.sources()) {
                        return Err(masked_in_expression(&field.alias_column, rule));
                    }
                }
                if record {
                    report.fields.extend(fields);
                }
                Ok(())
            }
            other => Err(MaskError::unsupported(format!("query body {other}"))),
        }
    }

    fn rewrite_select(
        &self,
        select: &mut Select,
        lineage: Vec<ProjectionLineage>,
        report: &mut RewriteReport,
        record: bool,
    ) -> Result<(), MaskError> {
        let items = std::mem::take(&mut select.projection);
        let mut projection = Vec::with_capacity(items.len());
        for (item, item_lineage) in items.into_iter().zip(lineage) {
            match item_lineage {
                ProjectionLineage::Field(field) => {
                    projection.push(self.rewrite_item(item, field, report, record)?);
                }
                ProjectionLineage::Wildcard(fields) => {
                    let needs_mask = fields
                        .iter()
                        .any(|f| self.policy.lookup_any(f.sources()).is_some());
                    if !needs_mask {
                        if record {
                            report.fields.extend(fields);
                        }
                        projection.push(item);
                        continue;
                    }
                    for field in fields {
                        let item = SelectItem::UnnamedExpr(column_expr(&field));
                        projection.push(self.rewrite_item(item, field, report, record)?);
                    }
                }
            }
        }
        select.projection = projection;
        Ok(())
    }

    fn rewrite_item(
        &self,
        item: SelectItem,
        mut field: FieldRelation,
        report: &mut RewriteReport,
        record: bool,
    ) -> Result<SelectItem, MaskError> {
        let rule = match &field.provenance {
            Provenance::Column(origin) => self.policy.lookup(origin),
            Provenance::Expression { sources } => {
                if let Some(rule) = self.policy.lookup_any(sources) {
                    return Err(masked_in_expression(&item.to_string(), rule));
                }
                None
            }
        };

        let item = match rule {
            None => item,
            Some(rule) => {
                let (expr, alias) = match item {
                    SelectItem::UnnamedExpr(expr) => {
                        let alias = visible_ident(&expr, &field);
                        (expr, alias)
                    }
                    SelectItem::ExprWithAlias { expr, alias } => (expr, alias),
                    other => {
                        return Err(MaskError::Internal(anyhow::anyhow!(
                            "cannot mask projection item {other}"
                        )));
                    }
                };
                let masked = mask_call(&self.dialect, &rule.function, &expr)?;
                field.mask_func = Some(rule.function.clone());
                field.masked = true;
                report.masked += 1;
                SelectItem::ExprWithAlias {
                    expr: masked,
                    alias,
                }
            }
        };

        if record {
            report.fields.push(field);
        }
        Ok(item)
    }
}

/// Check that `function` can wrap a column, e.g. `MASK_PHONE` or
/// `masking.phone`.
pub fn validate_mask_function(function: &str) -> Result<(), MaskError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = function.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(MaskError::InvalidMaskFunction(function.to_string()));
    }
    mask_call(
        &PostgreSqlDialect {},
        function,
        &Expr::Identifier(Ident::new("value")),
    )
    .map(|_| ())
}

fn mask_call(dialect: &PostgreSqlDialect, function: &str, expr: &Expr) -> Result<Expr, MaskError> {
    let text = format!("{function}({expr})");
    let parsed = Parser::new(dialect)
        .try_with_sql(&text)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|_| MaskError::InvalidMaskFunction(function.to_string()))?;
    match parsed {
        Expr::Function(_) => Ok(parsed),
        _ => Err(MaskError::InvalidMaskFunction(function.to_string())),
    }
}

fn masked_in_expression(item: &str, rule: &MaskRule) -> MaskError {
    MaskError::unsupported(format!(
        "{item} computes over masked column {}.{}.{}",
        rule.database, rule.table, rule.column
    ))
}

/// The name the client sees for an unaliased item.
fn visible_ident(expr: &Expr, field: &FieldRelation) -> Ident {
    match expr {
        Expr::Identifier(name) => name.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .cloned()
            .unwrap_or_else(|| ident(&field.alias_column)),
        Expr::Nested(inner) => visible_ident(inner, field),
        _ => ident(&field.alias_column),
    }
}

fn column_expr(field: &FieldRelation) -> Expr {
    if field.alias_table.is_empty() {
        Expr::Identifier(ident(&field.alias_column))
    } else {
        Expr::CompoundIdentifier(vec![ident(&field.alias_table), ident(&field.alias_column)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SqlAnalyzer;
    use pretty_assertions::assert_eq;
    use shroud_core::TableCatalogConfig;
    use std::collections::BTreeMap;

    fn catalog() -> TableCatalogConfig {
        let mut shop = BTreeMap::new();
        shop.insert(
            "customer".to_string(),
            vec!["id".to_string(), "name".to_string(), "mobile".to_string()],
        );
        TableCatalogConfig(BTreeMap::from([("shop".to_string(), shop)]))
    }

    fn phone_policy() -> MaskPolicy {
        let mut policy = MaskPolicy::new();
        policy.extend(
            &[MaskRule {
                name: "phone".to_string(),
                database: "shop".to_string(),
                table: "customer".to_string(),
                column: "mobile".to_string(),
                function: "MASK_PHONE".to_string(),
            }],
            None,
        );
        policy
    }

    fn rewrite(sql: &str) -> Result<(String, RewriteReport), MaskError> {
        let catalog = catalog();
        let policy = phone_policy();
        let mut statement = SqlAnalyzer::new().parse_one(sql)?;
        let mut resolver = LineageResolver::new(&catalog, Some("shop"));
        let report = MaskRewriter::new(&policy).rewrite(&mut statement, &mut resolver)?;
        Ok((statement.to_string(), report))
    }

    #[test]
    fn test_masks_plain_column() {
        let (sql, report) = rewrite("SELECT id, mobile FROM customer").unwrap();
        assert_eq!(sql, "SELECT id, MASK_PHONE(mobile) AS mobile FROM customer");
        assert_eq!(report.masked, 1);
        assert_eq!(report.fields[1].mask_func.as_deref(), Some("MASK_PHONE"));
        assert!(!report.fields[0].masked);
    }

    #[test]
    fn test_keeps_explicit_alias() {
        let (sql, _) = rewrite("SELECT c.mobile AS phone FROM customer AS c").unwrap();
        assert_eq!(sql, "SELECT MASK_PHONE(c.mobile) AS phone FROM customer AS c");
    }

    #[test]
    fn test_expands_wildcard_only_when_needed() {
        let (sql, _) = rewrite("SELECT * FROM customer").unwrap();
        assert_eq!(
            sql,
            "SELECT customer.id, customer.name, MASK_PHONE(customer.mobile) AS mobile FROM customer"
        );

        let (sql, report) = rewrite("SELECT c.id, c.name FROM customer AS c").unwrap();
        assert_eq!(sql, "SELECT c.id, c.name FROM customer AS c");
        assert_eq!(report.masked, 0);
    }

    #[test]
    fn test_masks_through_derived_table() {
        let (sql, _) = rewrite("SELECT x.m FROM (SELECT mobile AS m FROM customer) AS x").unwrap();
        assert_eq!(
            sql,
            "SELECT MASK_PHONE(x.m) AS m FROM (SELECT mobile AS m FROM customer) AS x"
        );
    }

    #[test]
    fn test_wildcard_over_unaliased_derived_table_is_unqualified() {
        let (sql, report) = rewrite("SELECT * FROM (SELECT id, mobile FROM customer)").unwrap();
        assert_eq!(
            sql,
            "SELECT id, MASK_PHONE(mobile) AS mobile FROM (SELECT id, mobile FROM customer)"
        );
        assert_eq!(report.masked, 1);
    }

    #[test]
    fn test_masks_every_union_branch() {
        let (sql, report) =
            rewrite("SELECT mobile FROM customer UNION ALL SELECT mobile FROM customer").unwrap();
        assert_eq!(
            sql,
            "SELECT MASK_PHONE(mobile) AS mobile FROM customer UNION ALL SELECT MASK_PHONE(mobile) AS mobile FROM customer"
        );
        assert_eq!(report.masked, 2);
        assert_eq!(report.fields.len(), 1);
    }

    #[test]
    fn test_rejects_computation_over_masked_column() {
        let err = rewrite("SELECT (SELECT mobile FROM customer LIMIT 1) AS m").unwrap_err();
        assert!(matches!(err, MaskError::Unsupported { .. }));
    }

    #[test]
    fn test_validate_mask_function() {
        assert!(validate_mask_function("MASK_PHONE").is_ok());
        assert!(validate_mask_function("masking.phone").is_ok());
        assert!(validate_mask_function("mask phone").is_err());
        assert!(validate_mask_function("1mask").is_err());
        assert!(validate_mask_function("").is_err());
    }
}
