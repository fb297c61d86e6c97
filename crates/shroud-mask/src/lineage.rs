//! Field lineage.
//!
//! The resolver walks the `FROM` clause of a `SELECT` into an ordered scope
//! of visible fields and maps every projection item back to the base-table
//! column it reads. Derived tables and common table expressions carry their
//! own lineage outward, re-homed under the alias they are given.

use crate::catalog::TableCatalog;
use crate::error::MaskError;
use crate::parser::{is_system_schema, name_parts, normalize};
use serde::Serialize;
use sqlparser::ast::{
    Expr, FunctionArguments, Join, JoinConstraint, JoinOperator, ObjectName, Query, Select,
    SelectItem, SelectItemQualifiedWildcardKind, SetExpr, Statement, TableAlias, TableFactor,
    TableWithJoins, Visit, Visitor, visit_expressions,
};
use std::collections::HashMap;
use std::ops::ControlFlow;

/// Functions that may take column arguments without hiding a column's
/// value behind a computation the mask cannot follow.
const SCALAR_FUNCTIONS: &[&str] = &[
    "clock_timestamp",
    "connection_id",
    "current_database",
    "current_date",
    "current_schema",
    "current_time",
    "current_timestamp",
    "current_user",
    "gen_random_uuid",
    "last_insert_id",
    "localtime",
    "localtimestamp",
    "now",
    "pg_backend_pid",
    "random",
    "session_user",
    "statement_timestamp",
    "timeofday",
    "transaction_timestamp",
    "version",
];

/// Functions that read data the statement never names as a relation: SQL
/// passed as text, tables passed by name, files and other servers.
/// `set_config` is here because it changes the pooled session.
const INDIRECT_READS: &[&str] = &[
    "cursor_to_xml", "cursor_to_xmlschema", "database_to_xml",
    "database_to_xml_and_xmlschema", "database_to_xmlschema", "dblink", "dblink_exec",
    "dblink_fetch", "dblink_get_result", "dblink_open", "dblink_send_query", "lo_export",
    "lo_get", "lo_import", "pg_read_binary_file", "pg_read_file", "query_to_xml",
    "query_to_xml_and_xmlschema", "query_to_xmlschema", "schema_to_xml",
    "schema_to_xml_and_xmlschema", "schema_to_xmlschema", "set_config", "table_to_xml",
    "table_to_xml_and_xmlschema", "table_to_xmlschema", "ts_stat",
];

/// Catalog relations holding sampled column values.
const STATISTICS_RELATIONS: &[&str] = &[
    "pg_statistic", "pg_statistic_ext_data", "pg_stats", "pg_stats_ext", "pg_stats_ext_exprs",
];

const AGGREGATES: &[&str] = &[
    "array_agg", "avg", "bit_and", "bit_or", "bool_and", "bool_or", "count", "every",
    "json_agg", "json_object_agg", "jsonb_agg", "jsonb_object_agg", "max", "min",
    "percentile_cont", "percentile_disc", "mode", "stddev", "stddev_pop", "stddev_samp",
    "string_agg", "sum", "var_pop", "var_samp", "variance", "xmlagg",
];

/// A base-table column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnOrigin {
    pub database: String,
    pub table: String,
    pub column: String,
}

/// Where a projected value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// The value of one column, unchanged.
    Column(ColumnOrigin),
    /// Computed; `sources` lists every column it reads.
    Expression { sources: Vec<ColumnOrigin> },
}

/// Lineage of one output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRelation {
    /// Table name or alias the field is visible under. Empty for computed
    /// fields and for fields of an unaliased derived table.
    pub alias_table: String,
    /// Column name the client sees.
    pub alias_column: String,
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_func: Option<String>,
    pub masked: bool,
}

impl FieldRelation {
    fn column(alias_table: &str, origin: ColumnOrigin) -> Self {
        Self {
            alias_table: alias_table.to_string(),
            alias_column: origin.column.clone(),
            provenance: Provenance::Column(origin),
            mask_func: None,
            masked: false,
        }
    }

    fn expression(alias_column: String, sources: Vec<ColumnOrigin>) -> Self {
        Self {
            alias_table: String::new(),
            alias_column,
            provenance: Provenance::Expression { sources },
            mask_func: None,
            masked: false,
        }
    }

    /// The column this field passes through unchanged, if any.
    pub fn origin(&self) -> Option<&ColumnOrigin> {
        match &self.provenance {
            Provenance::Column(origin) => Some(origin),
            Provenance::Expression { .. } => None,
        }
    }

    /// Every column the field's value depends on.
    pub fn sources(&self) -> &[ColumnOrigin] {
        match &self.provenance {
            Provenance::Column(origin) => std::slice::from_ref(origin),
            Provenance::Expression { sources } => sources,
        }
    }
}

/// Lineage of one projection item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionLineage {
    Field(FieldRelation),
    /// `*` or `t.*`, in the order the fields are produced.
    Wildcard(Vec<FieldRelation>),
}

/// Lineage of a `SELECT` projection, one entry per item as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectLineage {
    pub items: Vec<ProjectionLineage>,
}

impl SelectLineage {
    /// Output fields in result order.
    pub fn into_fields(self) -> Vec<FieldRelation> {
        let mut fields = Vec::new();
        for item in self.items {
            match item {
                ProjectionLineage::Field(field) => fields.push(field),
                ProjectionLineage::Wildcard(expanded) => fields.extend(expanded),
            }
        }
        fields
    }
}

/// Fields visible to one `SELECT`, in `FROM` order.
#[derive(Debug, Default)]
struct Scope {
    fields: Vec<FieldRelation>,
    consumed: Vec<bool>,
    /// A `USING` or `NATURAL` join collapsed some columns.
    merged: bool,
}

impl Scope {
    fn extend(&mut self, fields: Vec<FieldRelation>) {
        self.consumed
            .extend(std::iter::repeat_n(false, fields.len()));
        self.fields.extend(fields);
    }

    fn find(&self, qualifier: Option<&str>, column: &str, fresh_only: bool) -> Option<usize> {
        self.fields
            .iter()
            .zip(&self.consumed)
            .position(|(field, consumed)| {
                !(fresh_only && *consumed)
                    && field.alias_column.eq_ignore_ascii_case(column)
                    && qualifier.is_none_or(|q| field.alias_table.eq_ignore_ascii_case(q))
            })
    }

    /// Resolve a projected column reference. The first unused match wins
    /// and is marked used; once every match is used the first one is
    /// returned again.
    fn take(&mut self, qualifier: Option<&str>, column: &str) -> Option<FieldRelation> {
        let index = self
            .find(qualifier, column, true)
            .or_else(|| self.find(qualifier, column, false))?;
        self.consumed[index] = true;
        Some(self.fields[index].clone())
    }

    fn peek(&self, qualifier: Option<&str>, column: &str) -> Option<&FieldRelation> {
        self.find(qualifier, column, false).map(|i| &self.fields[i])
    }
}

/// Resolves projection lineage for one statement.
///
/// Alias bindings are shared by the whole statement: naming two different
/// tables with one alias is an [`MaskError::AliasConflict`] even when the
/// two uses sit in different subqueries.
pub struct LineageResolver<'a> {
    catalog: &'a dyn TableCatalog,
    database: Option<String>,
    aliases: HashMap<String, String>,
    ctes: Vec<Vec<(String, Vec<FieldRelation>)>>,
}

impl<'a> LineageResolver<'a> {
    /// `database` is the logical database unqualified tables belong to.
    pub fn new(catalog: &'a dyn TableCatalog, database: Option<&str>) -> Self {
        Self {
            catalog,
            database: database.map(str::to_lowercase),
            aliases: HashMap::new(),
            ctes: Vec::new(),
        }
    }

    /// Output lineage of a statement. Statements without a result set have
    /// none.
    pub fn resolve_statement(&mut self, statement: &Statement) -> Result<Vec<FieldRelation>, MaskError> {
        match statement {
            Statement::Query(query) => self.resolve_query(query),
            _ => Ok(Vec::new()),
        }
    }

    pub fn resolve_query(&mut self, query: &Query) -> Result<Vec<FieldRelation>, MaskError> {
        self.enter_with(query)?;
        let fields = self.resolve_set_expr(&query.body);
        self.leave_with(query);
        fields
    }

    /// Bring the query's common table expressions into scope.
    pub(crate) fn enter_with(&mut self, query: &Query) -> Result<(), MaskError> {
        let Some(with) = &query.with else {
            return Ok(());
        };
        if with.recursive {
            return Err(MaskError::unsupported("recursive common table expression"));
        }
        self.ctes.push(Vec::new());
        for cte in &with.cte_tables {
            let name = normalize(&cte.alias.name);
            let mut fields = self.resolve_query(&cte.query)?;
            rehome(&mut fields, &cte.alias);
            if let Some(scope) = self.ctes.last_mut() {
                scope.push((name, fields));
            }
        }
        Ok(())
    }

    pub(crate) fn leave_with(&mut self, query: &Query) {
        if query.with.is_some() {
            self.ctes.pop();
        }
    }

    pub fn resolve_set_expr(&mut self, body: &SetExpr) -> Result<Vec<FieldRelation>, MaskError> {
        match body {
            SetExpr::Select(select) => Ok(self.resolve_select(select)?.into_fields()),
            SetExpr::Query(query) => self.resolve_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                let left = self.resolve_set_expr(left)?;
                let right = self.resolve_set_expr(right)?;
                Ok(merge_branches(left, right))
            }
            SetExpr::Values(values) => {
                let width = values.rows.first().map_or(0, Vec::len);
                let mut fields: Vec<FieldRelation> = (1..=width)
                    .map(|i| FieldRelation::expression(format!("column{i}"), Vec::new()))
                    .collect();
                let empty = Scope::default();
                for row in &values.rows {
                    for (field, expr) in fields.iter_mut().zip(row) {
                        let sources = self.expression_sources(expr, &empty)?;
                        if let Provenance::Expression { sources: known } = &mut field.provenance {
                            push_unique(known, &sources);
                        }
                    }
                }
                Ok(fields)
            }
            other => Err(MaskError::unsupported(format!("query body {other}"))),
        }
    }

    /// Lineage of every projection item of one `SELECT`.
    pub fn resolve_select(&mut self, select: &Select) -> Result<SelectLineage, MaskError> {
        let mut scope = Scope::default();
        for table in &select.from {
            self.resolve_table_with_joins(table, &mut scope)?;
        }
        let mut items = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            items.push(self.resolve_item(item, &mut scope)?);
        }
        Ok(SelectLineage { items })
    }

    fn resolve_table_with_joins(
        &mut self,
        table: &TableWithJoins,
        scope: &mut Scope,
    ) -> Result<(), MaskError> {
        self.resolve_table_factor(&table.relation, scope)?;
        for join in &table.joins {
            if merges_columns(join) {
                scope.merged = true;
            }
            self.resolve_table_factor(&join.relation, scope)?;
        }
        Ok(())
    }

    fn resolve_table_factor(&mut self, factor: &TableFactor, scope: &mut Scope) -> Result<(), MaskError> {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    return Err(MaskError::unsupported(format!("table function {name}")));
                }
                let fields = self.resolve_table(name, alias.as_ref())?;
                scope.extend(fields);
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let mut fields = self.resolve_query(subquery)?;
                match alias {
                    Some(alias) => rehome(&mut fields, alias),
                    // Inner qualifiers are out of scope here.
                    None => fields.iter_mut().for_each(|f| f.alias_table.clear()),
                }
                scope.extend(fields);
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
                ..
            } => {
                let mut inner = Scope::default();
                self.resolve_table_with_joins(table_with_joins, &mut inner)?;
                let mut fields = inner.fields;
                if let Some(alias) = alias {
                    rehome(&mut fields, alias);
                }
                scope.merged |= inner.merged;
                scope.extend(fields);
            }
            other => return Err(MaskError::unsupported(format!("table source {other}"))),
        }
        Ok(())
    }

    fn resolve_table(
        &mut self,
        name: &ObjectName,
        alias: Option<&TableAlias>,
    ) -> Result<Vec<FieldRelation>, MaskError> {
        let parts = name_parts(name);
        let (schema, table) = match parts.as_slice() {
            [table] => (None, table.clone()),
            [schema, table] | [_, schema, table] => (Some(schema.clone()), table.clone()),
            _ => return Err(MaskError::unsupported(format!("table name {name}"))),
        };
        let visible = alias.map_or_else(|| table.clone(), |a| normalize(&a.name));

        if schema.is_none() {
            if let Some(fields) = self.cte(&table) {
                let mut fields = fields.to_vec();
                for field in &mut fields {
                    field.alias_table = visible.clone();
                }
                if let Some(alias) = alias {
                    rename_columns(&mut fields, alias);
                }
                return Ok(fields);
            }
        }

        let database = match schema {
            Some(schema) => schema,
            None => self.database.clone().ok_or(MaskError::DatabaseNotSelected)?,
        };
        let system = is_system_schema(&database)
            || (table.starts_with("pg_") && self.catalog.columns(&database, &table).is_none());
        if system {
            return Err(MaskError::unsupported(format!(
                "system catalog {table} read together with user tables"
            )));
        }
        let columns = self
            .catalog
            .columns(&database, &table)
            .ok_or_else(|| MaskError::UnknownTable(format!("{database}.{table}")))?;
        self.bind_alias(&visible, &format!("{database}.{table}"))?;

        let mut fields: Vec<FieldRelation> = columns
            .iter()
            .map(|column| {
                FieldRelation::column(
                    &visible,
                    ColumnOrigin {
                        database: database.clone(),
                        table: table.clone(),
                        column: column.clone(),
                    },
                )
            })
            .collect();
        if let Some(alias) = alias {
            rename_columns(&mut fields, alias);
        }
        Ok(fields)
    }

    fn cte(&self, name: &str) -> Option<&[FieldRelation]> {
        self.ctes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(cte, _)| cte.eq_ignore_ascii_case(name))
            .map(|(_, fields)| fields.as_slice())
    }

    fn bind_alias(&mut self, alias: &str, table: &str) -> Result<(), MaskError> {
        match self.aliases.get(&alias.to_lowercase()) {
            Some(bound) if !bound.eq_ignore_ascii_case(table) => Err(MaskError::AliasConflict {
                alias: alias.to_string(),
                first: bound.clone(),
                second: table.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.aliases.insert(alias.to_lowercase(), table.to_string());
                Ok(())
            }
        }
    }

    fn resolve_item(&mut self, item: &SelectItem, scope: &mut Scope) -> Result<ProjectionLineage, MaskError> {
        match item {
            SelectItem::UnnamedExpr(expr) => self
                .resolve_expr(expr, None, scope)
                .map(ProjectionLineage::Field),
            SelectItem::ExprWithAlias { expr, alias } => self
                .resolve_expr(expr, Some(normalize(alias)), scope)
                .map(ProjectionLineage::Field),
            SelectItem::Wildcard(_) => {
                if scope.merged {
                    return Err(MaskError::unsupported("* over a USING or NATURAL join"));
                }
                Ok(ProjectionLineage::Wildcard(scope.fields.clone()))
            }
            SelectItem::QualifiedWildcard(kind, _) => {
                let qualifier = wildcard_qualifier(kind)?;
                let fields: Vec<FieldRelation> = scope
                    .fields
                    .iter()
                    .filter(|f| f.alias_table.eq_ignore_ascii_case(&qualifier))
                    .cloned()
                    .collect();
                if fields.is_empty() {
                    return Err(MaskError::UnknownTable(qualifier));
                }
                Ok(ProjectionLineage::Wildcard(fields))
            }
        }
    }

    fn resolve_expr(
        &mut self,
        expr: &Expr,
        alias: Option<String>,
        scope: &mut Scope,
    ) -> Result<FieldRelation, MaskError> {
        if let Some((qualifier, column)) = column_ref(expr) {
            let mut field = scope
                .take(qualifier.as_deref(), &column)
                .ok_or_else(|| MaskError::UnresolvedColumn(expr.to_string()))?;
            if let Some(alias) = alias {
                field.alias_column = alias;
            }
            return Ok(field);
        }
        let sources = self.expression_sources(expr, scope)?;
        Ok(FieldRelation::expression(
            alias.unwrap_or_else(|| output_name(expr)),
            sources,
        ))
    }

    /// Every column an expression reads, scalar subqueries included.
    fn expression_sources(&mut self, expr: &Expr, scope: &Scope) -> Result<Vec<ColumnOrigin>, MaskError> {
        let mut sources = Vec::new();
        let flow = visit_expressions(expr, |e| {
            if let Some((qualifier, column)) = column_ref(e) {
                if let Some(field) = scope.peek(qualifier.as_deref(), &column) {
                    push_unique(&mut sources, field.sources());
                }
            } else if let Expr::Subquery(query) = e {
                match self.resolve_query(query) {
                    Ok(fields) => {
                        for field in &fields {
                            push_unique(&mut sources, field.sources());
                        }
                    }
                    Err(err) => return ControlFlow::Break(err),
                }
            }
            ControlFlow::Continue(())
        });
        match flow {
            ControlFlow::Break(err) => Err(err),
            ControlFlow::Continue(()) => Ok(sources),
        }
    }
}

/// Reject statements whose projections compute over columns in ways the
/// mask rewrite cannot follow: aggregates, window functions, casts and
/// functions outside [`SCALAR_FUNCTIONS`] that read a column.
pub fn check_supported(statement: &Statement) -> Result<(), MaskError> {
    match statement.visit(&mut SupportCheck) {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(()),
    }
}

struct SupportCheck;

impl Visitor for SupportCheck {
    type Break = MaskError;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let mut selects = Vec::new();
        collect_selects(&query.body, &mut selects);
        for select in selects {
            for item in &select.projection {
                let expr = match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
                    _ => continue,
                };
                if let Err(err) = check_expr(expr) {
                    return ControlFlow::Break(err);
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Reject reads that bypass lineage: functions in [`INDIRECT_READS`],
/// whether called in an expression or in `FROM`, and the statistics views
/// that sample column values. Applies to every forwarded statement,
/// including those that name no user table.
pub fn check_indirect_reads(statement: &Statement) -> Result<(), MaskError> {
    match statement.visit(&mut IndirectReadCheck) {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(()),
    }
}

struct IndirectReadCheck;

impl IndirectReadCheck {
    fn function(name: &ObjectName) -> ControlFlow<MaskError> {
        let last = name_parts(name).pop().unwrap_or_default();
        if INDIRECT_READS.contains(&last.as_str()) {
            ControlFlow::Break(MaskError::unsupported(format!("function {last}")))
        } else {
            ControlFlow::Continue(())
        }
    }
}

impl Visitor for IndirectReadCheck {
    type Break = MaskError;

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let last = name_parts(relation).pop().unwrap_or_default();
        if STATISTICS_RELATIONS.contains(&last.as_str()) {
            return ControlFlow::Break(MaskError::unsupported(format!("statistics view {last}")));
        }
        Self::function(relation)
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::Function { name, .. } => Self::function(name),
            _ => ControlFlow::Continue(()),
        }
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Function(function) => Self::function(&function.name),
            _ => ControlFlow::Continue(()),
        }
    }
}

fn collect_selects<'q>(body: &'q SetExpr, out: &mut Vec<&'q Select>) {
    match body {
        SetExpr::Select(select) => out.push(select),
        SetExpr::SetOperation { left, right, .. } => {
            collect_selects(left, out);
            collect_selects(right, out);
        }
        _ => {}
    }
}

fn check_expr(expr: &Expr) -> Result<(), MaskError> {
    let flow = visit_expressions(expr, |e| match e {
        Expr::Cast { .. } | Expr::Convert { .. } => {
            ControlFlow::Break(MaskError::unsupported(format!("cast {e}")))
        }
        Expr::Function(function) => {
            let name = name_parts(&function.name).pop().unwrap_or_default();
            if function.over.is_some() {
                return ControlFlow::Break(MaskError::unsupported(format!("window function {e}")));
            }
            if !function.within_group.is_empty() || AGGREGATES.contains(&name.as_str()) {
                return ControlFlow::Break(MaskError::unsupported(format!("aggregate {e}")));
            }
            if !SCALAR_FUNCTIONS.contains(&name.as_str()) && reads_columns(&function.args) {
                return ControlFlow::Break(MaskError::unsupported(format!("function {e}")));
            }
            ControlFlow::Continue(())
        }
        _ => ControlFlow::Continue(()),
    });
    match flow {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn reads_columns(args: &FunctionArguments) -> bool {
    visit_expressions(args, |e| {
        if column_ref(e).is_some() || matches!(e, Expr::Subquery(_)) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .is_break()
}

/// `(qualifier, column)` of a plain column reference.
pub(crate) fn column_ref(expr: &Expr) -> Option<(Option<String>, String)> {
    match expr {
        Expr::Identifier(ident) => Some((None, normalize(ident))),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let n = parts.len();
            Some((Some(normalize(&parts[n - 2])), normalize(&parts[n - 1])))
        }
        Expr::Nested(inner) => column_ref(inner),
        _ => None,
    }
}

/// Result column name Postgres gives an unaliased computed item.
fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Function(function) => name_parts(&function.name)
            .pop()
            .unwrap_or_else(|| "?column?".to_string()),
        Expr::Nested(inner) => output_name(inner),
        _ => "?column?".to_string(),
    }
}

/// Qualifier of `t.*` or `db.t.*`.
fn wildcard_qualifier(kind: &SelectItemQualifiedWildcardKind) -> Result<String, MaskError> {
    match kind {
        SelectItemQualifiedWildcardKind::ObjectName(name) => name_parts(name)
            .pop()
            .ok_or_else(|| MaskError::unsupported(format!("wildcard {name}.*"))),
        SelectItemQualifiedWildcardKind::Expr(expr) => {
            Err(MaskError::unsupported(format!("wildcard over expression {expr}")))
        }
    }
}

/// Whether the join collapses same-named columns into one.
fn merges_columns(join: &Join) -> bool {
    let constraint = match &join.join_operator {
        JoinOperator::Join(c)
        | JoinOperator::Inner(c)
        | JoinOperator::Left(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::Right(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::CrossJoin(c)
        | JoinOperator::Semi(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::Anti(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c)
        | JoinOperator::StraightJoin(c)
        | JoinOperator::AsOf { constraint: c, .. } => c,
        JoinOperator::CrossApply | JoinOperator::OuterApply => return false,
    };
    match constraint {
        JoinConstraint::Using(_) | JoinConstraint::Natural => true,
        JoinConstraint::On(_) | JoinConstraint::None => false,
    }
}

fn rehome(fields: &mut [FieldRelation], alias: &TableAlias) {
    let table = normalize(&alias.name);
    for field in fields.iter_mut() {
        field.alias_table = table.clone();
    }
    rename_columns(fields, alias);
}

/// Apply an alias column list positionally.
fn rename_columns(fields: &mut [FieldRelation], alias: &TableAlias) {
    for (field, column) in fields.iter_mut().zip(&alias.columns) {
        field.alias_column = normalize(&column.name);
    }
}

/// Combine set-operation branches: names come from the left branch, and a
/// position fed by different columns becomes an expression over all of them.
fn merge_branches(left: Vec<FieldRelation>, right: Vec<FieldRelation>) -> Vec<FieldRelation> {
    let mut right = right.into_iter();
    left.into_iter()
        .map(|mut field| {
            if let Some(other) = right.next() {
                if other.provenance != field.provenance {
                    let mut sources = field.sources().to_vec();
                    push_unique(&mut sources, other.sources());
                    field.provenance = Provenance::Expression { sources };
                }
            }
            field
        })
        .collect()
}

fn push_unique(into: &mut Vec<ColumnOrigin>, from: &[ColumnOrigin]) {
    for origin in from {
        if !into.contains(origin) {
            into.push(origin.clone());
        }
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
        shop.insert(
            "orders".to_string(),
            vec!["id".to_string(), "customer_id".to_string(), "total".to_string()],
        );
        let mut crm = BTreeMap::new();
        crm.insert(
            "customer".to_string(),
            vec!["id".to_string(), "email".to_string()],
        );
        TableCatalogConfig(BTreeMap::from([
            ("shop".to_string(), shop),
            ("crm".to_string(), crm),
        ]))
    }

    fn resolve(sql: &str, database: Option<&str>) -> Result<Vec<FieldRelation>, MaskError> {
        let catalog = catalog();
        let statement = SqlAnalyzer::new().parse_one(sql).unwrap();
        LineageResolver::new(&catalog, database).resolve_statement(&statement)
    }

    fn origin(database: &str, table: &str, column: &str) -> ColumnOrigin {
        ColumnOrigin {
            database: database.to_string(),
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    fn summary(fields: &[FieldRelation]) -> Vec<(String, String, Option<String>)> {
        fields
            .iter()
            .map(|f| {
                (
                    f.alias_table.clone(),
                    f.alias_column.clone(),
                    f.origin().map(|o| format!("{}.{}.{}", o.database, o.table, o.column)),
                )
            })
            .collect()
    }

    fn row(table: &str, column: &str, origin: Option<&str>) -> (String, String, Option<String>) {
        (table.to_string(), column.to_string(), origin.map(str::to_string))
    }

    #[test]
    fn test_wildcard_follows_schema_order() {
        let fields = resolve("SELECT * FROM customer", Some("shop")).unwrap();
        assert_eq!(
            summary(&fields),
            vec![
                row("customer", "id", Some("shop.customer.id")),
                row("customer", "name", Some("shop.customer.name")),
                row("customer", "mobile", Some("shop.customer.mobile")),
            ]
        );
    }

    #[test]
    fn test_qualified_wildcard_through_alias() {
        let fields = resolve("SELECT a.* FROM customer AS a", Some("shop")).unwrap();
        assert_eq!(fields.len(), 3);
        assert!(fields.iter().all(|f| f.alias_table == "a"));
        assert_eq!(fields[2].origin(), Some(&origin("shop", "customer", "mobile")));
    }

    #[test]
    fn test_alias_renames_visible_column() {
        let fields = resolve("SELECT mobile AS phone FROM shop.customer", None).unwrap();
        assert_eq!(fields[0].alias_column, "phone");
        assert_eq!(fields[0].origin(), Some(&origin("shop", "customer", "mobile")));
    }

    #[test]
    fn test_derived_table_rehomed_under_alias() {
        let fields = resolve(
            "SELECT x.p FROM (SELECT mobile AS p, id FROM customer) AS x",
            Some("shop"),
        )
        .unwrap();
        assert_eq!(summary(&fields), vec![row("x", "p", Some("shop.customer.mobile"))]);
    }

    #[test]
    fn test_derived_alias_column_list() {
        let fields = resolve(
            "SELECT d.c FROM (SELECT name, mobile FROM customer) AS d (n, c)",
            Some("shop"),
        )
        .unwrap();
        assert_eq!(fields[0].origin(), Some(&origin("shop", "customer", "mobile")));
    }

    #[test]
    fn test_cte_lineage() {
        let fields = resolve(
            "WITH c AS (SELECT id, mobile FROM customer) SELECT c.mobile FROM c",
            Some("shop"),
        )
        .unwrap();
        assert_eq!(summary(&fields), vec![row("c", "mobile", Some("shop.customer.mobile"))]);
    }

    #[test]
    fn test_join_across_databases() {
        let fields = resolve(
            "SELECT s.mobile, c.email FROM shop.customer AS s JOIN crm.customer AS c ON s.id = c.id",
            None,
        )
        .unwrap();
        assert_eq!(
            summary(&fields),
            vec![
                row("s", "mobile", Some("shop.customer.mobile")),
                row("c", "email", Some("crm.customer.email")),
            ]
        );
    }

    #[test]
    fn test_repeated_unqualified_names_consume_in_order() {
        let fields = resolve(
            "SELECT id, id FROM customer AS c JOIN orders AS o ON o.customer_id = c.id",
            Some("shop"),
        )
        .unwrap();
        assert_eq!(fields[0].origin(), Some(&origin("shop", "customer", "id")));
        assert_eq!(fields[1].origin(), Some(&origin("shop", "orders", "id")));
    }

    #[test]
    fn test_exhausted_name_reuses_first_match() {
        let fields = resolve("SELECT mobile, mobile FROM customer", Some("shop")).unwrap();
        assert_eq!(fields[0].origin(), fields[1].origin());
    }

    #[test]
    fn test_expression_tracks_sources() {
        let fields = resolve("SELECT (SELECT mobile FROM customer LIMIT 1) AS m", Some("shop")).unwrap();
        assert_eq!(fields[0].alias_column, "m");
        assert_eq!(fields[0].origin(), None);
        assert_eq!(fields[0].sources(), &[origin("shop", "customer", "mobile")][..]);
    }

    #[test]
    fn test_union_takes_left_names_and_merges_sources() {
        let fields = resolve(
            "SELECT mobile FROM shop.customer UNION SELECT email FROM crm.customer AS cc",
            None,
        )
        .unwrap();
        assert_eq!(fields[0].alias_column, "mobile");
        assert_eq!(
            fields[0].sources(),
            &[origin("shop", "customer", "mobile"), origin("crm", "customer", "email")][..]
        );
    }

    #[test]
    fn test_unqualified_table_without_database() {
        assert!(matches!(
            resolve("SELECT * FROM customer", None),
            Err(MaskError::DatabaseNotSelected)
        ));
    }

    #[test]
    fn test_alias_conflict() {
        let err = resolve(
            "SELECT t.id FROM customer AS t JOIN (SELECT t.id FROM orders AS t) AS o ON o.id = t.id",
            Some("shop"),
        )
        .unwrap_err();
        assert!(matches!(err, MaskError::AliasConflict { .. }), "{err}");
    }

    #[test]
    fn test_unknown_table_and_column() {
        assert!(matches!(
            resolve("SELECT * FROM invoices", Some("shop")),
            Err(MaskError::UnknownTable(_))
        ));
        assert!(matches!(
            resolve("SELECT phone FROM customer", Some("shop")),
            Err(MaskError::UnresolvedColumn(_))
        ));
    }

    #[test]
    fn test_wildcard_over_using_join_rejected() {
        let err = resolve(
            "SELECT * FROM customer JOIN orders USING (id)",
            Some("shop"),
        )
        .unwrap_err();
        assert!(matches!(err, MaskError::Unsupported { .. }));
    }

    #[test]
    fn test_join_constraints_that_merge_columns() {
        for sql in [
            "SELECT * FROM customer NATURAL JOIN orders",
            "SELECT * FROM customer LEFT JOIN orders USING (id)",
            "SELECT * FROM (customer FULL JOIN orders USING (id))",
        ] {
            assert!(
                matches!(resolve(sql, Some("shop")), Err(MaskError::Unsupported { .. })),
                "{sql}"
            );
        }
        let fields = resolve(
            "SELECT * FROM customer AS c JOIN orders AS o ON c.id = o.customer_id",
            Some("shop"),
        )
        .unwrap();
        assert_eq!(fields.len(), 6);
    }

    #[test]
    fn test_qualified_wildcard_with_schema_and_quotes() {
        let fields = resolve("SELECT shop.customer.* FROM shop.customer", None).unwrap();
        assert_eq!(fields.len(), 3);

        let fields = resolve(r#"SELECT "C".* FROM customer AS "C""#, Some("shop")).unwrap();
        assert!(fields.iter().all(|f| f.alias_table == "C"));

        assert!(matches!(
            resolve("SELECT x.* FROM customer AS c", Some("shop")),
            Err(MaskError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_unaliased_derived_table_drops_inner_qualifier() {
        let fields = resolve("SELECT * FROM (SELECT mobile FROM customer)", Some("shop")).unwrap();
        assert_eq!(summary(&fields), vec![row("", "mobile", Some("shop.customer.mobile"))]);
    }

    #[test]
    fn test_recursive_cte_rejected() {
        let err = resolve(
            "WITH RECURSIVE r AS (SELECT id FROM customer) SELECT id FROM r",
            Some("shop"),
        )
        .unwrap_err();
        assert!(matches!(err, MaskError::Unsupported { .. }));
    }

    fn check(sql: &str) -> Result<(), MaskError> {
        check_supported(&SqlAnalyzer::new().parse_one(sql).unwrap())
    }

    #[test]
    fn test_support_check() {
        assert!(check("SELECT id, mobile, now() FROM customer").is_ok());
        assert!(check("SELECT id FROM customer WHERE lower(name) = 'x'").is_ok());
        assert!(check("SELECT COUNT(*) FROM customer").is_err());
        assert!(check("SELECT max(id) FROM customer").is_err());
        assert!(check("SELECT CAST(mobile AS TEXT) FROM customer").is_err());
        assert!(check("SELECT row_number() OVER (ORDER BY id) FROM customer").is_err());
        assert!(check("SELECT concat(name, mobile) FROM customer").is_err());
        assert!(check("SELECT x.m FROM (SELECT upper(mobile) AS m FROM customer) AS x").is_err());
    }

    fn indirect(sql: &str) -> Result<(), MaskError> {
        check_indirect_reads(&SqlAnalyzer::new().parse_one(sql).unwrap())
    }

    #[test]
    fn test_indirect_reads_rejected() {
        for sql in [
            "SELECT query_to_xml('SELECT mobile FROM shop_0001.customer', true, false, '')",
            "SELECT pg_catalog.table_to_xml('shop_0001.customer', true, false, '')",
            "SELECT length(query_to_xml('SELECT 1', true, false, '')::text)",
            "SELECT * FROM dblink('dbname=shop', 'SELECT mobile FROM customer') AS t (m TEXT)",
            "SELECT most_common_vals FROM pg_stats WHERE attname = 'mobile'",
            "SELECT * FROM pg_catalog.pg_statistic",
            "SELECT id FROM customer WHERE id IN (SELECT 1 FROM pg_stats)",
            "SELECT set_config('search_path', 'other', false)",
        ] {
            assert!(matches!(indirect(sql), Err(MaskError::Unsupported { .. })), "{sql}");
        }
        assert!(indirect("SELECT version(), now()").is_ok());
        assert!(indirect("SELECT relname FROM pg_catalog.pg_class").is_ok());
        assert!(indirect("SELECT mobile FROM customer").is_ok());
    }
}
