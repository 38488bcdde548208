mod common;

use anyhow::Result;
use common::{counting_tasks, monitor, security, start_executor, start_executor_with, SECRET};
use dts_config::{DispatchConfig, NodeConfig};
use dts_mesh::{
    DispatchError, Dispatcher, ExecutionLocation, HttpPeerClient, PeerClient, PeerMaintenance, PeerRegistry,
};
use dts_node::start_node;
use dts_types::{Peer, ProjectIdentity};
use serde_json::{json, Map};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        timeout_secs: 5,
        max_retries: 2,
        backoff_ms: 10,
        probe_timeout_secs: 2,
        ..DispatchConfig::default()
    }
}

fn http_client() -> Arc<dyn PeerClient> {
    Arc::new(HttpPeerClient::new(&fast_config()).expect("http client"))
}

struct Origin {
    dispatcher: Dispatcher,
    registry: Arc<PeerRegistry>,
    runs: Arc<AtomicUsize>,
}

/// An overloaded node whose only candidate is `peer`.
async fn overloaded_origin(peer: Peer) -> Origin {
    let runs = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(PeerRegistry::new(
        "node-a",
        Duration::from_secs(30),
        Duration::from_secs(300),
    ));
    let node_id = peer.node_id.clone();
    registry.upsert(peer).await;
    registry.set_compatibility(&node_id, true).await;

    let dispatcher = Dispatcher::new(
        counting_tasks(runs.clone()),
        monitor(0.95),
        registry.clone(),
        http_client(),
        fast_config(),
    )
    .with_security(security("node-a", SECRET))
    .with_host("host-a");
    Origin {
        dispatcher,
        registry,
        runs,
    }
}

#[tokio::test]
async fn test_overloaded_node_offloads_to_live_peer() -> Result<()> {
    let executor = start_executor("host-b", Some(security("node-b", SECRET)), 0.1).await;
    let origin = overloaded_origin(executor.peer("node-b")).await;

    let execution = origin
        .dispatcher
        .invoke_detailed("counted", vec![json!(3)], Map::new())
        .await?;

    assert_eq!(execution.host, "host-b");
    assert_eq!(execution.result, json!({"runs": 1, "echo": [3]}));
    match execution.location {
        ExecutionLocation::Remote { node_id, addr } => {
            assert_eq!(node_id, "node-b");
            assert_eq!(addr, executor.addr());
        }
        ExecutionLocation::Local => panic!("task should have been offloaded"),
    }
    assert_eq!(executor.runs(), 1);
    assert_eq!(origin.runs.load(Ordering::SeqCst), 0);
    assert_eq!(origin.registry.len().await, 1);

    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_offload_runs_locally() -> Result<()> {
    // The peer holds a different secret and cannot open our tasks.
    let executor = start_executor("host-b", Some(security("node-b", "another-secret")), 0.1).await;
    let origin = overloaded_origin(executor.peer("node-b")).await;

    let execution = origin
        .dispatcher
        .invoke_detailed("counted", vec![], Map::new())
        .await?;

    assert_eq!(execution.location, ExecutionLocation::Local);
    assert_eq!(execution.host, "host-a");
    assert_eq!(origin.runs.load(Ordering::SeqCst), 1);
    assert_eq!(executor.runs(), 0);

    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remote_task_failure_is_reported() -> Result<()> {
    let executor = start_executor("host-b", Some(security("node-b", SECRET)), 0.1).await;
    let origin = overloaded_origin(executor.peer("node-b")).await;

    let err = origin
        .dispatcher
        .invoke("prime_calculation", vec![json!("lots")], Map::new())
        .await
        .unwrap_err();
    match err {
        DispatchError::Execution { host, .. } => assert_eq!(host, "node-b"),
        other => panic!("expected a remote execution error, got {other:?}"),
    }
    assert_eq!(origin.runs.load(Ordering::SeqCst), 0);

    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_maintenance_checks_compatibility_over_http() -> Result<()> {
    let same = start_executor("host-b", None, 0.1).await;
    let foreign = start_executor_with(
        "host-c",
        None,
        0.1,
        ProjectIdentity {
            version: "2.0".into(),
            ..ProjectIdentity::default()
        },
        false,
    )
    .await;

    let registry = Arc::new(PeerRegistry::new(
        "node-a",
        Duration::from_secs(30),
        Duration::from_secs(300),
    ));
    let same_peer = Peer::from_url(&same.url("/run"))?;
    let foreign_peer = Peer::from_url(&foreign.url("/run"))?;
    registry.register_direct(same_peer.clone()).await;
    registry.register_direct(foreign_peer.clone()).await;

    let maintenance = PeerMaintenance {
        registry: registry.clone(),
        discovery: None,
        registration: None,
        monitor: monitor(0.1),
        client: http_client(),
        identity: ProjectIdentity::default(),
        browse_timeout: Duration::from_millis(100),
        probe_timeout: Duration::from_secs(2),
    };
    maintenance.refresh().await;

    let usable = registry.usable_peers().await;
    assert_eq!(usable.len(), 1);
    assert_eq!(usable[0].node_id, same_peer.node_id);

    let foreign_record = registry.get(&foreign_peer.node_id).await.expect("direct peer kept");
    assert_eq!(foreign_record.compatible, Some(false));
    assert!(foreign_record.direct);

    same.api.shutdown().await;
    foreign.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_nodes_with_direct_peers_find_each_other() -> Result<()> {
    let mut config_b = NodeConfig::default();
    config_b.node.node_id = Some("node-b".into());
    config_b.node.listen_address = "127.0.0.1:0".into();
    config_b.discovery.enabled = false;
    config_b.security.shared_secret = Some(SECRET.into());
    config_b.security.kdf_iterations = 1_000;
    let node_b = start_node(config_b.clone()).await?;

    let mut config_a = config_b;
    config_a.node.node_id = Some("node-a".into());
    config_a.discovery.interval_secs = 1;
    config_a.discovery.static_peers = vec![format!("http://{}/run", node_b.local_addr())];
    let node_a = start_node(config_a).await?;

    let mut usable = Vec::new();
    for _ in 0..50 {
        usable = node_a.registry.usable_peers().await;
        if !usable.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(usable.len(), 1);
    assert_eq!(usable[0].port, node_b.local_addr().port());

    // Wherever it runs, the caller sees the same result.
    let result = node_a
        .dispatcher
        .invoke("prime_calculation", vec![json!(10)], Map::new())
        .await?;
    assert_eq!(result["count"], json!(4));

    node_a.shutdown().await;
    node_b.shutdown().await;
    Ok(())
}
