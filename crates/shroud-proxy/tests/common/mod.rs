//! Configuration directory fixtures.

#![allow(dead_code)]

use shroud_backend::PoolFactory;
use shroud_core::{ConfigSet, ProxyConfig};
use shroud_proxy::{Manager, ManagerSettings, SessionContext};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    /// A configuration directory with one shop database, its mask rules, a
    /// whitelist for `auditor` and the given namespaces.
    pub fn new(namespaces: &[(&str, u16)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["namespace", "rule", "white_list"] {
            fs::create_dir(root.join(sub)).unwrap();
        }

        fs::write(
            root.join("rule/shop_rules.yaml"),
            r#"
- name: phone
  table: customer
  column: mobile
  function: MASK_PHONE
- name: mail
  table: customer
  column: email
  function: MASK_EMAIL
"#,
        )
        .unwrap();
        fs::write(
            root.join("white_list/shop_wl.yaml"),
            r#"
- user: auditor
  from_time: "2000-01-01 00:00:00"
  to_time: "2999-01-01 00:00:00"
  rules: phone
"#,
        )
        .unwrap();
        fs::write(
            root.join("databases.yaml"),
            "- database: shop\n  rule: shop_rules\n  white_list: shop_wl\n",
        )
        .unwrap();
        fs::write(
            root.join("tables.yaml"),
            r#"
shop:
  customer: [id, name, mobile, email]
  orders: [id, customer_id, total]
"#,
        )
        .unwrap();

        let fixture = Self { dir };
        for (name, port) in namespaces {
            fixture.write_namespace(name, *port, "secret");
        }
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_namespace(&self, name: &str, port: u16, password: &str) {
        fs::write(
            self.path().join(format!("namespace/{name}.yaml")),
            format!(
                r#"
name: {name}
proxy_port: {port}
allowed_dbs: [shop]
default_phy_dbs: {{shop: shop_0001}}
black_sql: ["(?i)pg_sleep"]
slice:
  user_name: proxy
  slaves: ["db1:5432@2", "db2:5432"]
  capacity: 2
  max_capacity: 4
users:
  - user_name: alice
    password: {password}
  - user_name: auditor
    password: audit
"#
            ),
        )
        .unwrap();
    }

    pub fn remove_namespace(&self, name: &str) {
        fs::remove_file(self.path().join(format!("namespace/{name}.yaml"))).unwrap();
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1".to_string(),
            config_dir: self.path().to_path_buf(),
            acquire_timeout_ms: 50,
            ..ProxyConfig::default()
        }
    }

    pub fn manager(&self, factory: Arc<dyn PoolFactory>) -> Arc<Manager> {
        let set = ConfigSet::load_dir(self.path()).unwrap();
        let settings = ManagerSettings {
            acquire_timeout: Duration::from_millis(50),
            close_grace: Duration::from_secs(30),
        };
        Arc::new(Manager::new(&set, factory, settings).unwrap())
    }
}

/// An authenticated session on the namespace listening on `port`.
pub fn session(manager: &Manager, port: u16, user: &str, database: Option<&str>) -> SessionContext {
    let namespace = manager.namespace_by_port(port).unwrap();
    let mut session = SessionContext::new(namespace, Some("127.0.0.1:50000".parse().unwrap()));
    session.user = Some(user.to_string());
    session.database = database.map(str::to_string);
    session
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
