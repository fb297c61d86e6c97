//! Statements through the runner: planning, masking, routing.

mod common;

use common::{Fixture, session};
use pretty_assertions::assert_eq;
use shroud_backend::memory::MemoryPoolFactory;
use shroud_proxy::{Executor, ProxyError, SliceExecutor, StatementRunner};
use std::sync::Arc;

const PORT: u16 = 16401;

fn setup() -> (Fixture, Arc<MemoryPoolFactory>, StatementRunner, Arc<shroud_proxy::Manager>) {
    let fixture = Fixture::new(&[("tenant_a", PORT)]);
    let factory = Arc::new(MemoryPoolFactory::default());
    let manager = fixture.manager(factory.clone());
    let runner = StatementRunner::new(manager.clone(), Box::new(SliceExecutor::new()));
    (fixture, factory, runner, manager)
}

/// The echo responder returns the SQL the backend received.
fn backend_sql(result: &shroud_backend::QueryResult) -> &str {
    result.rows[0][0].as_deref().unwrap()
}

#[tokio::test]
async fn test_masked_select_runs_on_physical_schema() {
    let (_fixture, factory, runner, manager) = setup();
    let session = session(&manager, PORT, "alice", Some("shop"));

    let result = runner
        .run(&session, "SELECT c.id, c.mobile FROM customer AS c WHERE c.id = 7")
        .await
        .unwrap();
    assert_eq!(
        backend_sql(&result),
        "SELECT c.id, MASK_PHONE(c.mobile) AS mobile FROM customer AS c WHERE c.id = 7"
    );
    assert_eq!(factory.executed()[0].schema, "shop_0001");
}

#[tokio::test]
async fn test_wildcard_is_expanded_when_masking() {
    let (_fixture, _factory, runner, manager) = setup();
    let session = session(&manager, PORT, "alice", Some("shop"));

    let result = runner.run(&session, "SELECT * FROM customer").await.unwrap();
    assert_eq!(
        backend_sql(&result),
        "SELECT customer.id, customer.name, MASK_PHONE(customer.mobile) AS mobile, MASK_EMAIL(customer.email) AS email FROM customer"
    );

    let result = runner.run(&session, "SELECT * FROM orders").await.unwrap();
    assert_eq!(backend_sql(&result), "SELECT * FROM orders");
}

#[tokio::test]
async fn test_whitelisted_user_sees_exempted_column() {
    let (_fixture, _factory, runner, manager) = setup();
    let session = session(&manager, PORT, "auditor", Some("shop"));

    let result = runner
        .run(&session, "SELECT mobile, email FROM customer")
        .await
        .unwrap();
    assert_eq!(
        backend_sql(&result),
        "SELECT mobile, MASK_EMAIL(email) AS email FROM customer"
    );
}

#[tokio::test]
async fn test_rejected_statements_never_reach_the_backend() {
    let (_fixture, factory, runner, manager) = setup();
    let session = session(&manager, PORT, "alice", Some("shop"));

    let cases = [
        ("SELECT COUNT(*) FROM customer", "0A000"),
        ("SELECT CAST(mobile AS TEXT) FROM customer", "0A000"),
        ("UPDATE customer SET mobile = NULL", "0A000"),
        ("SELECT query_to_xml('SELECT mobile FROM customer', true, false, '')", "0A000"),
        ("SELECT most_common_vals FROM pg_stats", "0A000"),
        ("SELECT pg_sleep(5)", "42501"),
        ("SELECT id FROM crm.contact", "42501"),
        ("SELECT nope FROM customer", "42703"),
        ("SELECT id FROM invoices", "42P01"),
        ("SELEC id", "42601"),
    ];
    for (sql, sqlstate) in cases {
        let err = runner.run(&session, sql).await.unwrap_err();
        assert_eq!(err.sqlstate(), sqlstate, "{sql}: {err}");
    }
    assert!(factory.executed().is_empty());
}

#[tokio::test]
async fn test_unqualified_table_needs_a_database() {
    let (_fixture, _factory, runner, manager) = setup();
    let session = session(&manager, PORT, "alice", None);

    let err = runner.run(&session, "SELECT id FROM customer").await.unwrap_err();
    assert_eq!(err.sqlstate(), "3D000");

    let result = runner.run(&session, "SELECT mobile FROM shop.customer").await.unwrap();
    assert_eq!(
        backend_sql(&result),
        "SELECT MASK_PHONE(mobile) AS mobile FROM shop_0001.customer"
    );
}

#[tokio::test]
async fn test_last_insert_id_is_answered_locally() {
    let (_fixture, factory, runner, manager) = setup();
    let session = session(&manager, PORT, "alice", Some("shop"));

    let result = runner.run(&session, "SELECT LAST_INSERT_ID()").await.unwrap();
    assert_eq!(result.columns[0].name, "last_insert_id");
    assert_eq!(result.rows, vec![vec![Some("0".to_string())]]);

    runner.executor().set_last_insert_id(99);
    let result = runner.run(&session, "select last_insert_id()").await.unwrap();
    assert_eq!(result.rows, vec![vec![Some("99".to_string())]]);
    assert!(factory.executed().is_empty());
}

#[tokio::test]
async fn test_statements_follow_slice_weights() {
    let (_fixture, factory, runner, manager) = setup();
    let session = session(&manager, PORT, "alice", Some("shop"));

    for _ in 0..30 {
        runner.run(&session, "SELECT id FROM orders").await.unwrap();
    }
    let pools = factory.pools();
    let counts: Vec<usize> = pools.iter().map(|p| p.executed().len()).collect();
    assert_eq!(counts, vec![20, 10]);
}

#[tokio::test]
async fn test_backend_failure_is_reported_per_statement() {
    let fixture = Fixture::new(&[("tenant_a", PORT)]);
    let factory = Arc::new(MemoryPoolFactory::with_responder(Arc::new(|_: &str, _: &str| {
        Err(shroud_backend::BackendError::Query("relation does not exist".to_string()))
    })));
    let manager = fixture.manager(factory.clone());
    let runner = StatementRunner::new(manager.clone(), Box::new(SliceExecutor::new()));
    let session = session(&manager, PORT, "alice", Some("shop"));

    let err = runner.run(&session, "SELECT id FROM orders").await.unwrap_err();
    assert!(matches!(err, ProxyError::Backend(_)));
    assert_eq!(err.sqlstate(), "XX000");
    // The connection went back to its pool.
    assert!(factory.pools().iter().all(|p| p.available() == 4));
}
