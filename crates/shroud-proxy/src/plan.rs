//! Statement planning: from client SQL to what the backend runs.

use crate::error::ProxyError;
use crate::manager::Generation;
use crate::namespace::Namespace;
use chrono::{DateTime, Local};
use shroud_mask::{
    LineageResolver, MaskError, MaskPolicy, MaskRewriter, MaskRule, RewriteReport, SqlAnalyzer,
    StatementKind, check_indirect_reads, check_supported,
};
use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Everything a statement is planned against.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub generation: &'a Generation,
    pub namespace: &'a Namespace,
    /// Logical database selected by the session.
    pub database: Option<&'a str>,
    pub user: &'a str,
    pub client_ip: Option<IpAddr>,
    pub now: DateTime<Local>,
}

/// What to do with one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Answer from the session's last insert id.
    LastInsertId,
    /// Run `sql` on the namespace slice with `schema` as search path.
    Forward {
        schema: String,
        sql: String,
        report: RewriteReport,
    },
}

/// Turns client SQL into a [`Plan`].
#[derive(Debug, Clone, Default)]
pub struct Planner {
    analyzer: SqlAnalyzer,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan one statement. Fails closed: anything that cannot be masked
    /// with certainty is rejected.
    pub fn plan(&self, ctx: &PlanContext<'_>, sql: &str) -> Result<Plan, ProxyError> {
        if let Some(pattern) = ctx.namespace.blacklisted(sql) {
            return Err(ProxyError::Forbidden(pattern.to_string()));
        }

        let mut statement = self.analyzer.parse_one(sql)?;
        if is_last_insert_id(&statement) {
            return Ok(Plan::LastInsertId);
        }

        let kind = self.analyzer.classify(&statement);
        if kind != StatementKind::Other {
            check_indirect_reads(&statement)?;
        }
        let report = match kind {
            StatementKind::Other => {
                let keyword = sql.split_whitespace().next().unwrap_or_default();
                return Err(MaskError::unsupported(format!(
                    "{} statements are not forwarded",
                    keyword.to_uppercase()
                ))
                .into());
            }
            StatementKind::Explain => {
                self.check_explain(ctx, &statement)?;
                RewriteReport::default()
            }
            StatementKind::Query if !self.analyzer.touches_user_tables(&statement) => {
                RewriteReport::default()
            }
            StatementKind::Query => {
                let databases = self.allowed_databases(ctx, &statement)?;
                check_supported(&statement)?;
                let policy = self.policy(ctx, &databases);
                let catalog = ctx.generation.databases.catalog();
                let mut resolver = LineageResolver::new(catalog, ctx.database);
                MaskRewriter::new(&policy).rewrite(&mut statement, &mut resolver)?
            }
        };

        self.analyzer
            .rewrite_databases(&mut statement, ctx.namespace.physical_map());
        let schema = ctx
            .database
            .map(|db| ctx.namespace.physical_db(db))
            .unwrap_or_default();

        Ok(Plan::Forward {
            schema,
            sql: statement.to_string(),
            report,
        })
    }

    /// `EXPLAIN` runs only over queries this planner would accept, since
    /// `EXPLAIN ANALYZE` executes its statement.
    fn check_explain(&self, ctx: &PlanContext<'_>, statement: &Statement) -> Result<(), ProxyError> {
        let Statement::Explain { statement, .. } = statement else {
            return Ok(());
        };
        if self.analyzer.classify(statement) != StatementKind::Query {
            return Err(MaskError::unsupported("EXPLAIN of a statement other than a query").into());
        }
        if self.analyzer.touches_user_tables(statement) {
            self.allowed_databases(ctx, statement)?;
            LineageResolver::new(ctx.generation.databases.catalog(), ctx.database)
                .resolve_statement(statement)?;
        }
        Ok(())
    }

    /// Logical databases the statement reads, all of which must be allowed
    /// in the namespace.
    fn allowed_databases(
        &self,
        ctx: &PlanContext<'_>,
        statement: &Statement,
    ) -> Result<BTreeSet<String>, ProxyError> {
        let databases = self.analyzer.referenced_databases(statement, ctx.database);
        if let Some(denied) = databases.iter().find(|db| !ctx.namespace.is_allowed_db(db)) {
            return Err(ProxyError::DatabaseNotAllowed(denied.clone()));
        }
        Ok(databases)
    }

    /// Mask rules of every database read, minus the user's active exemptions.
    fn policy(&self, ctx: &PlanContext<'_>, databases: &BTreeSet<String>) -> MaskPolicy {
        let generation = ctx.generation;
        let mut policy = MaskPolicy::new();
        for database in databases {
            let Some(binding) = generation.databases.binding(database) else {
                continue;
            };
            let Some(rules) = binding
                .rule
                .as_deref()
                .and_then(|name| generation.rules.get(name))
            else {
                continue;
            };
            let exemption = binding.white_list.as_deref().and_then(|list| {
                generation
                    .white_lists
                    .active(list, ctx.user, ctx.client_ip, ctx.now)
            });
            if let Some(exemption) = exemption {
                tracing::debug!(database = %database, user = %ctx.user, ?exemption, "Whitelist active");
            }
            let rules: Vec<MaskRule> = rules
                .iter()
                .map(|rule| MaskRule::from_config(database, rule))
                .collect();
            policy.extend(&rules, exemption);
        }
        policy
    }
}

/// `SELECT LAST_INSERT_ID()`, with or without an alias.
fn is_last_insert_id(statement: &Statement) -> bool {
    let Statement::Query(query) = statement else {
        return false;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return false;
    };
    if !select.from.is_empty() || select.projection.len() != 1 {
        return false;
    }
    let expr = match &select.projection[0] {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
        _ => return false,
    };
    match expr {
        Expr::Function(function) => function
            .name
            .to_string()
            .eq_ignore_ascii_case("last_insert_id"),
        _ => false,
    }
}
