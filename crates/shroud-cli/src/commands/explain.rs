//! `shroud explain`: plan one statement against a configuration directory
//! without touching a backend.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;
use shroud_backend::{PgPoolFactory, PoolFactory};
use shroud_core::ConfigSet;
use shroud_core::config::white_list::TIME_FORMAT;
use shroud_mask::{FieldRelation, Provenance};
use shroud_proxy::{Generation, ManagerSettings, Plan, PlanContext, Planner};
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub namespace: String,
    pub database: Option<String>,
    pub user: String,
    pub client_ip: Option<IpAddr>,
    /// Local time whitelists are evaluated at; now when absent.
    pub at: Option<String>,
    pub sql: String,
}

#[derive(Debug, Serialize)]
pub struct Explanation {
    pub namespace: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Search path the statement would run with; empty for none.
    pub schema: String,
    /// Statement sent to the backend, absent when answered locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten: Option<String>,
    pub masked: usize,
    pub fields: Vec<FieldRelation>,
}

/// Plan `request.sql` the way a session of `request.user` would.
///
/// Pools are created through `factory` but never used.
pub fn explain(
    set: &ConfigSet,
    factory: &dyn PoolFactory,
    request: &ExplainRequest,
) -> anyhow::Result<Explanation> {
    let generation = Generation::build(set, factory, &ManagerSettings::default(), 0)?;
    let namespace = generation
        .namespaces
        .get(&request.namespace)
        .ok_or_else(|| anyhow::anyhow!("namespace {} not found", request.namespace))?;

    let database = request.database.as_deref().filter(|db| !db.is_empty());
    if let Some(db) = database {
        if !namespace.is_allowed_db(db) {
            anyhow::bail!("database {db} is not allowed in namespace {}", request.namespace);
        }
    }

    let now = match &request.at {
        Some(at) => parse_local(at)?,
        None => Local::now(),
    };
    let ctx = PlanContext {
        generation: &generation,
        namespace,
        database,
        user: &request.user,
        client_ip: request.client_ip,
        now,
    };

    let mut explanation = Explanation {
        namespace: request.namespace.clone(),
        user: request.user.clone(),
        database: database.map(str::to_string),
        schema: String::new(),
        rewritten: None,
        masked: 0,
        fields: Vec::new(),
    };
    match Planner::new().plan(&ctx, &request.sql)? {
        Plan::LastInsertId => {}
        Plan::Forward { schema, sql, report } => {
            explanation.schema = schema;
            explanation.rewritten = Some(sql);
            explanation.masked = report.masked;
            explanation.fields = report.fields;
        }
    }
    Ok(explanation)
}

pub fn run_explain(dir: &Path, request: &ExplainRequest, json: bool) -> anyhow::Result<()> {
    let set = ConfigSet::load_dir(dir)?;
    let explanation = explain(&set, &PgPoolFactory, request)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&explanation)?);
        return Ok(());
    }

    println!("Namespace: {}  user: {}", explanation.namespace, explanation.user);
    if let Some(db) = &explanation.database {
        println!("Database:  {db}");
    }
    match &explanation.rewritten {
        None => println!("Answered by the proxy."),
        Some(sql) => {
            if !explanation.schema.is_empty() {
                println!("Schema:    {}", explanation.schema);
            }
            println!("Rewritten: {sql}");
        }
    }
    if explanation.fields.is_empty() {
        return Ok(());
    }

    println!();
    println!("{:<24} {:<40} MASK", "FIELD", "ORIGIN");
    for field in &explanation.fields {
        let name = if field.alias_table.is_empty() {
            field.alias_column.clone()
        } else {
            format!("{}.{}", field.alias_table, field.alias_column)
        };
        let mask = field.mask_func.as_deref().unwrap_or("-");
        println!("{name:<24} {:<40} {mask}", origin(&field.provenance));
    }
    Ok(())
}

fn origin(provenance: &Provenance) -> String {
    match provenance {
        Provenance::Column(origin) => format!("{}.{}.{}", origin.database, origin.table, origin.column),
        Provenance::Expression { sources } if sources.is_empty() => "(constant)".to_string(),
        Provenance::Expression { sources } => sources
            .iter()
            .map(|o| format!("{}.{}.{}", o.database, o.table, o.column))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn parse_local(value: &str) -> anyhow::Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT)
        .map_err(|e| anyhow::anyhow!("invalid --at {value:?}: {e}"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow::anyhow!("--at {value:?} does not exist in the local time zone"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shroud_backend::memory::MemoryPoolFactory;

    fn config_set() -> ConfigSet {
        let mut set = ConfigSet::default();
        let namespace = shroud_core::NamespaceConfig::from_yaml(
            r#"
name: tenant
proxy_port: 6001
allowed_dbs: [shop]
default_phy_dbs: {shop: shop_0001}
slice:
  user_name: proxy
  slaves: ["db1:5432"]
users:
  - user_name: alice
    password: secret
  - user_name: auditor
    password: audit
"#,
        )
        .unwrap();
        set.namespaces.insert(namespace.name.clone(), namespace);
        set.rule_lists.insert(
            "shop_rules".to_string(),
            serde_yaml::from_str(
                "name: shop_rules\nrules:\n  - {name: phone, table: customer, column: mobile, function: MASK_PHONE}\n",
            )
            .unwrap(),
        );
        set.white_lists.insert(
            "shop_wl".to_string(),
            serde_yaml::from_str(
                "name: shop_wl\nrecords:\n  - {user: auditor, from_time: \"2024-01-01 00:00:00\", to_time: \"2024-02-01 00:00:00\", rules: phone}\n",
            )
            .unwrap(),
        );
        set.databases = serde_yaml::from_str("- {database: shop, rule: shop_rules, white_list: shop_wl}\n").unwrap();
        set.tables = serde_yaml::from_str("shop:\n  customer: [id, mobile]\n").unwrap();
        set
    }

    fn request(user: &str, at: Option<&str>, sql: &str) -> ExplainRequest {
        ExplainRequest {
            namespace: "tenant".to_string(),
            database: Some("shop".to_string()),
            user: user.to_string(),
            client_ip: None,
            at: at.map(str::to_string),
            sql: sql.to_string(),
        }
    }

    #[tokio::test]
    async fn test_explain_reports_lineage_and_rewrite() {
        let factory = MemoryPoolFactory::default();
        let explanation = explain(&config_set(), &factory, &request("alice", None, "SELECT * FROM customer")).unwrap();

        assert_eq!(explanation.schema, "shop_0001");
        assert_eq!(
            explanation.rewritten.as_deref(),
            Some("SELECT customer.id, MASK_PHONE(customer.mobile) AS mobile FROM customer")
        );
        assert_eq!(explanation.masked, 1);
        assert_eq!(origin(&explanation.fields[1].provenance), "shop.customer.mobile");

        let json = serde_json::to_value(&explanation).unwrap();
        assert_eq!(json["fields"][1]["mask_func"], "MASK_PHONE");
        assert!(factory.executed().is_empty());
    }

    #[tokio::test]
    async fn test_explain_honours_whitelist_window() {
        let factory = MemoryPoolFactory::default();
        let sql = "SELECT mobile FROM customer";

        let inside = explain(&config_set(), &factory, &request("auditor", Some("2024-01-15 12:00:00"), sql)).unwrap();
        assert_eq!(inside.rewritten.as_deref(), Some(sql));
        assert_eq!(inside.masked, 0);

        let after = explain(&config_set(), &factory, &request("auditor", Some("2024-02-01 00:00:00"), sql)).unwrap();
        assert_eq!(after.rewritten.as_deref(), Some("SELECT MASK_PHONE(mobile) AS mobile FROM customer"));
    }

    #[tokio::test]
    async fn test_explain_rejects_unknown_namespace_and_database() {
        let factory = MemoryPoolFactory::default();
        let mut unknown = request("alice", None, "SELECT 1");
        unknown.namespace = "other".to_string();
        assert!(explain(&config_set(), &factory, &unknown).is_err());

        let mut foreign = request("alice", None, "SELECT 1");
        foreign.database = Some("crm".to_string());
        assert!(explain(&config_set(), &factory, &foreign).is_err());

        assert!(explain(&config_set(), &factory, &request("alice", Some("tomorrow"), "SELECT 1")).is_err());
    }
}
