#![deny(unused_must_use)]

mod common;
use common::*;

use raconteur::local::PollingWatcher;
use raconteur::prelude::*;
use serial_test::serial;

use tokio::time::{sleep, timeout, Duration};

use std::path::Path;
use std::sync::Arc;

const WAIT: Duration = Duration::from_secs(5);

fn local_transport(node: &Arc<Node>, registry: Arc<NodeLockRegistry>) -> Arc<LocalTransport> {
    LocalTransport::new(node.clone(), registry, LocalTransportConfig::default())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn info_file(root: &Path, name: &str) -> std::path::PathBuf {
    NodeDirectories::new(root)
        .private_transport_dir()
        .node_name_file(name, "info")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn connect_by_node_name_and_exchange_messages() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server_node = test_node(dir.path(), "");
    let client_node = test_node(dir.path(), "");
    let a = local_transport(&server_node, NodeLockRegistry::new());
    let b = local_transport(&client_node, NodeLockRegistry::new());

    a.start_server_as_node_name("alice").unwrap();
    assert!(a.is_server());
    assert_eq!(server_node.node_name(), "alice");
    assert!(!server_node.node_id().is_any());
    assert!(info_file(dir.path(), "alice").exists());

    let conn = b
        .create_transport_connection("rr+local:///?nodename=alice", 0)
        .await
        .unwrap();
    let client_ep = conn.local_endpoint();
    assert_ne!(client_ep, 0);
    assert_eq!(conn.remote_node_id(), server_node.node_id());
    assert_eq!(b.connection_endpoints(), vec![client_ep]);

    wait_until(|| a.connection_endpoints().len() == 1).await;
    let server_ep = a.connection_endpoints()[0];
    assert_ne!(server_ep, 0);
    assert_eq!(conn.remote_endpoint(), server_ep);

    let mut m = app_message("ping", 7);
    m.header.sender_endpoint = server_ep;
    m.header.receiver_endpoint = client_ep;
    a.send_message(m.clone()).await.unwrap();
    let got = timeout(WAIT, client_node.recv()).await.unwrap().unwrap();
    assert_eq!(got, m);

    let mut reply = app_message("pong", 8);
    reply.header.sender_endpoint = client_ep;
    reply.header.receiver_endpoint = server_ep;
    b.send_message(reply.clone()).await.unwrap();
    let got = timeout(WAIT, server_node.recv()).await.unwrap().unwrap();
    assert_eq!(got, reply);

    b.close_transport_connection(client_ep);
    assert!(b.check_connection(client_ep).is_err());
    wait_until(|| a.connection_endpoints().is_empty()).await;
    wait_until(|| server_node.closed_endpoints().contains(&server_ep)).await;

    a.close();
    b.close();
    assert!(!info_file(dir.path(), "alice").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn connect_by_node_id() {
    let dir = tempfile::tempdir().unwrap();
    let server_node = test_node(dir.path(), "");
    let client_node = test_node(dir.path(), "");
    let a = local_transport(&server_node, NodeLockRegistry::new());
    let b = local_transport(&client_node, NodeLockRegistry::new());

    let id = NodeId::new_random();
    a.start_server_as_node_id(id).unwrap();
    assert_eq!(server_node.node_id(), id);

    let url = format!("rr+local:///?nodeid={}", id);
    let conn = b.create_transport_connection(&url, 42).await.unwrap();
    assert_eq!(conn.local_endpoint(), 42);
    assert_eq!(conn.remote_node_id(), id);

    // The endpoint is now taken
    let again = b.create_transport_connection(&url, 42).await;
    assert!(matches!(again, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
#[serial]
async fn node_name_in_use_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let first_node = test_node(dir.path(), "");
    let second_node = test_node(dir.path(), "");

    // Separate registries behave like separate processes sharing run directories
    let first = local_transport(&first_node, NodeLockRegistry::new());
    let second = local_transport(&second_node, NodeLockRegistry::new());

    first.start_server_as_node_name("alice").unwrap();
    let taken = second.start_server_as_node_name("alice");
    assert!(matches!(taken, Err(Error::NodeNameAlreadyInUse(_))), "{:?}", taken);
    assert!(!second.is_server());

    first.close();
    drop(first);
    second.start_server_as_node_name("alice").unwrap();
    assert!(second.is_server());
    assert_eq!(second_node.node_name(), "alice");
}

#[tokio::test]
#[serial]
async fn shared_registry_rejects_duplicate_names() {
    let dir = tempfile::tempdir().unwrap();
    let registry = NodeLockRegistry::new();
    let first_node = test_node(&dir.path().join("one"), "");
    let second_node = test_node(&dir.path().join("two"), "");
    let first = local_transport(&first_node, registry.clone());
    let second = local_transport(&second_node, registry.clone());

    first.start_server_as_node_name("bob").unwrap();
    assert!(registry.is_node_name_locked("bob"));
    assert!(matches!(
        second.start_client_as_node_name("bob"),
        Err(Error::NodeNameAlreadyInUse(_))
    ));
    first.close();
    assert!(!registry.is_node_name_locked("bob"));
    second.start_client_as_node_name("bob").unwrap();
}

#[tokio::test]
#[serial]
async fn invalid_node_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let node = test_node(dir.path(), "");
    let transport = local_transport(&node, NodeLockRegistry::new());
    for name in ["", "9lives", "has space", "../escape"] {
        assert!(matches!(
            transport.start_server_as_node_name(name),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert!(!transport.is_server());
}

#[tokio::test]
#[serial]
async fn urls_are_validated_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let node = test_node(dir.path(), "");
    let transport = local_transport(&node, NodeLockRegistry::new());

    assert!(transport.can_connect_service("rr+local://host:1234/").is_err());
    assert!(transport.can_connect_service("rr+local://somehost/").is_err());
    assert!(!transport
        .can_connect_service("rr+tcp://localhost:48653/?service=x")
        .unwrap());
    assert!(transport
        .can_connect_service("rr+local:///?nodename=alice")
        .unwrap());

    let unaddressed = transport.create_transport_connection("rr+local:///", 0).await;
    assert!(matches!(unaddressed, Err(Error::Connection(_))));
    let nobody = transport
        .create_transport_connection("rr+local:///?nodename=nobody", 0)
        .await;
    assert!(matches!(nobody, Err(Error::Connection(_))));
    assert!(matches!(
        transport.check_connection(1234),
        Err(Error::Connection(_))
    ));
    let mut m = app_message("orphan", 0);
    m.header.sender_endpoint = 1234;
    assert!(matches!(
        transport.send_message(m).await,
        Err(Error::Connection(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn discovery_reports_running_servers() {
    let dir = tempfile::tempdir().unwrap();
    let server_node = test_node(dir.path(), "");
    let client_node = test_node(dir.path(), "");
    let a = local_transport(&server_node, NodeLockRegistry::new());
    let b = local_transport(&client_node, NodeLockRegistry::new());

    b.start_discovery_with(Box::new(PollingWatcher::new(Duration::from_millis(50))))
        .unwrap();
    assert!(matches!(
        b.start_discovery(),
        Err(Error::InvalidOperation(_))
    ));

    a.start_server_as_node_name("carol").unwrap();
    let id = server_node.node_id();
    wait_until(|| client_node.detected_nodes().iter().any(|n| n.node_id == id)).await;

    let found = b.get_detected_nodes().await.unwrap();
    let carol = found.iter().find(|n| n.node_id == id).unwrap();
    assert_eq!(carol.node_name, "carol");
    assert_eq!(carol.service_state_nonce, server_node.service_state_nonce());
    assert!(carol.urls[0].starts_with("rr+local:///"));
    assert!(carol.urls[0].contains("nodename=carol"));

    let nonce = server_node.refresh_service_state_nonce();
    a.update_service_state_nonce().unwrap();
    let found = b.get_detected_nodes().await.unwrap();
    let carol = found.iter().find(|n| n.node_id == id).unwrap();
    assert_eq!(carol.service_state_nonce, nonce);

    a.close();
    let found = b.get_detected_nodes().await.unwrap();
    assert!(found.iter().all(|n| n.node_id != id));
}

#[test]
#[serial]
fn blocking_calls_from_a_plain_thread() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let build = || {
        NodeConfig::new()
            .directories(NodeDirectories::new(dir.path()))
            .runtime_handle(runtime.handle().clone())
            .build()
            .unwrap()
    };
    let server_node = build();
    let client_node = build();
    let a = local_transport(&server_node, NodeLockRegistry::new());
    let b = local_transport(&client_node, NodeLockRegistry::new());

    a.start_server_as_node_name("dave").unwrap();
    let conn = b
        .create_transport_connection_blocking("rr+local:///?nodename=dave", 0)
        .unwrap();
    let mut m = app_message("blocking", 1);
    m.header.sender_endpoint = conn.local_endpoint();
    b.send_message_blocking(m.clone()).unwrap();
    let got = runtime
        .block_on(async { timeout(WAIT, server_node.recv()).await })
        .unwrap()
        .unwrap();
    assert_eq!(got, m);

    a.close();
    b.close();
}
