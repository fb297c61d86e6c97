//! Reloading a configuration directory into a running server.

mod common;

use common::{Fixture, free_port};
use shroud_backend::memory::MemoryPoolFactory;
use shroud_proxy::Server;
use std::sync::Arc;

#[tokio::test]
async fn test_reload_follows_the_directory() {
    let first = free_port();
    let fixture = Fixture::new(&[("tenant_a", first)]);
    let server = Server::bootstrap(fixture.proxy_config(), Arc::new(MemoryPoolFactory::default()))
        .await
        .unwrap();

    server.sync_listeners().await.unwrap();
    assert_eq!(server.listening_ports().await, vec![first]);
    tokio::net::TcpStream::connect(("127.0.0.1", first)).await.unwrap();

    let old = server.manager().namespace_by_port(first).unwrap();

    // New namespace, changed password for the old one.
    let second = free_port();
    fixture.write_namespace("tenant_a", first, "rotated");
    fixture.write_namespace("tenant_b", second, "secret");
    server.reload().await.unwrap();

    let mut ports = server.listening_ports().await;
    ports.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(ports, expected);

    let current = server.manager().current();
    assert!(current.users.authenticate("tenant_a", "alice", "rotated"));
    assert!(!current.users.authenticate("tenant_a", "alice", "secret"));
    assert!(current.users.authenticate("tenant_b", "alice", "secret"));

    // A session bound before the reload still reaches its backend.
    assert!(!old.slice().is_closed());
    assert!(old.slice().acquire().await.is_ok());

    fixture.remove_namespace("tenant_a");
    server.reload().await.unwrap();
    assert_eq!(server.listening_ports().await, vec![second]);
    assert!(server.manager().namespace_by_port(first).is_none());

    server.shutdown().await;
    assert!(server.listening_ports().await.is_empty());
}

#[tokio::test]
async fn test_invalid_directory_keeps_active_generation() {
    let port = free_port();
    let fixture = Fixture::new(&[("tenant_a", port)]);
    let server = Server::bootstrap(fixture.proxy_config(), Arc::new(MemoryPoolFactory::default()))
        .await
        .unwrap();
    let epoch = server.manager().current().epoch;

    // Two namespaces on one port.
    fixture.write_namespace("tenant_b", port, "secret");
    assert!(server.reload().await.is_err());

    let current = server.manager().current();
    assert_eq!(current.epoch, epoch);
    assert!(current.namespaces.contains("tenant_a"));
    assert!(!current.namespaces.contains("tenant_b"));
    assert!(!server.manager().is_staged());
}
