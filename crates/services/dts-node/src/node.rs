use crate::server::{start_api_server, ApiHandle, ExecutorState};
use dts_config::NodeConfig;
use dts_identity::SecurityContext;
use dts_mesh::{
    register, DiscoveryLoop, Dispatcher, HttpPeerClient, MdnsDiscovery, PeerClient, PeerMaintenance, PeerRegistry,
    ResourceMonitor, ServiceDiscovery, SystemSampler, TaskRegistry,
};
use dts_types::{Peer, PeerParseError, ProjectIdentity};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

/// A running node: executor, discovery loop and dispatcher.
pub struct NodeHandle {
    pub node_id: String,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<PeerRegistry>,
    pub security: Option<Arc<SecurityContext>>,
    api: ApiHandle,
    discovery_loop: DiscoveryLoop,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.api.local_addr()
    }

    pub async fn shutdown(self) {
        self.discovery_loop.shutdown().await;
        self.api.shutdown().await;
        tracing::info!("Node {} stopped", self.node_id);
    }
}

fn host_name() -> Option<String> {
    sys_info::hostname().ok().filter(|h| !h.trim().is_empty())
}

/// Address other hosts can reach us on, found through the routing table.
/// No packet is sent.
fn detect_local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("10.255.255.255:1")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Direct peer from a configured address. Host names are resolved once,
/// at start-up; IPv4 results are preferred.
async fn resolve_direct_peer(address: &str) -> anyhow::Result<Peer> {
    match Peer::from_url(address) {
        Ok(peer) => Ok(peer),
        Err(PeerParseError::InvalidAddress(_)) => {
            let authority = Peer::direct_authority(address)?;
            let mut resolved: Vec<SocketAddr> = tokio::net::lookup_host(authority.as_str())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to resolve '{}': {}", authority, e))?
                .collect();
            resolved.sort_by_key(|addr| !addr.is_ipv4());
            let addr = resolved
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("'{}' resolved to no address", authority))?;
            tracing::debug!("Resolved direct peer {} to {}", authority, addr);
            Ok(Peer::new(format!("direct:{}", addr), addr.ip(), addr.port(), 0.0))
        }
        Err(e) => Err(e.into()),
    }
}

/// Start every service of a node and return once they are running.
pub async fn start_node(config: NodeConfig) -> anyhow::Result<NodeHandle> {
    let host = host_name().unwrap_or_else(|| "dts-node".to_string());
    let node_id = config.node.node_id.clone().unwrap_or_else(|| host.clone());
    tracing::info!("Starting node {} on host {}", node_id, host);

    let security = match config.security.shared_secret.as_deref() {
        Some(secret) => {
            let context = SecurityContext::new(node_id.clone(), secret, config.security.kdf_iterations)
                .map_err(|e| anyhow::anyhow!("Failed to initialize security context: {}", e))?;
            Some(Arc::new(context))
        }
        None => {
            tracing::warn!("No shared secret configured; tasks travel as unsigned plaintext");
            None
        }
    };

    let tasks = Arc::new(TaskRegistry::with_builtin_tasks());
    let identity = ProjectIdentity::new(tasks.names());
    let monitor = Arc::new(ResourceMonitor::new(Arc::new(SystemSampler::new()), config.policy.clone()));

    let listen: SocketAddr = config
        .node
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", config.node.listen_address, e))?;
    let state = Arc::new(ExecutorState {
        tasks: tasks.clone(),
        monitor: monitor.clone(),
        security: security.clone(),
        identity: identity.clone(),
        host: host.clone(),
        allow_plaintext: config.security.allow_plaintext,
    });
    let api = start_api_server(state, listen).await?;

    let registry = Arc::new(PeerRegistry::new(
        node_id.clone(),
        config.discovery.stale_after(),
        config.discovery.evict_after(),
    ));
    for address in &config.discovery.static_peers {
        match resolve_direct_peer(address).await {
            Ok(peer) => registry.register_direct(peer).await,
            Err(e) => tracing::warn!("Ignoring direct peer '{}': {}", address, e),
        }
    }

    let client: Arc<dyn PeerClient> = Arc::new(
        HttpPeerClient::new(&config.dispatch).map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?,
    );

    let (discovery, registration) = if config.discovery.enabled {
        match MdnsDiscovery::new(config.discovery.service_type.clone()) {
            Ok(mdns) => {
                let discovery: Arc<dyn ServiceDiscovery> = Arc::new(mdns);
                let ip = match config.node.advertise_address.as_deref() {
                    Some(address) => address
                        .parse()
                        .map_err(|e| anyhow::anyhow!("Invalid advertise address '{}': {}", address, e))?,
                    None => detect_local_ip(),
                };
                let registration = match register(
                    discovery.clone(),
                    &node_id,
                    ip,
                    api.local_addr().port(),
                    monitor.current_load(),
                ) {
                    Ok(registration) => Some(registration),
                    Err(e) => {
                        tracing::warn!("Failed to advertise executor: {}", e);
                        None
                    }
                };
                (Some(discovery), registration)
            }
            Err(e) => {
                tracing::warn!("mDNS unavailable, continuing with direct peers only: {}", e);
                (None, None)
            }
        }
    } else {
        tracing::info!("Multicast discovery disabled");
        (None, None)
    };

    let discovery_loop = DiscoveryLoop::spawn(
        PeerMaintenance {
            registry: registry.clone(),
            discovery,
            registration,
            monitor: monitor.clone(),
            client: client.clone(),
            identity,
            browse_timeout: config.discovery.timeout(),
            probe_timeout: config.dispatch.probe_timeout(),
        },
        config.discovery.interval(),
    );

    let mut dispatcher = Dispatcher::new(tasks, monitor, registry.clone(), client, config.dispatch.clone()).with_host(host);
    if let Some(security) = &security {
        dispatcher = dispatcher.with_security(security.clone());
    }

    Ok(NodeHandle {
        node_id,
        dispatcher: Arc::new(dispatcher),
        registry,
        security,
        api,
        discovery_loop,
    })
}

/// Run a node until Ctrl+C.
pub async fn run_node(config: NodeConfig) -> anyhow::Result<()> {
    let node = start_node(config).await?;
    tracing::info!("Node {} serving on {}", node.node_id, node.local_addr());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;
    tracing::info!("Shutdown signal received. Exiting.");

    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.node_id = Some("test-node".into());
        config.node.listen_address = "127.0.0.1:0".into();
        config.discovery.enabled = false;
        config.security.kdf_iterations = 1_000;
        config
    }

    #[tokio::test]
    async fn test_start_and_stop_without_discovery() {
        let mut config = local_config();
        config.discovery.static_peers = vec!["http://10.0.0.9:7520/run".into(), "ftp://bad".into()];

        let node = start_node(config).await.unwrap();
        assert_eq!(node.node_id, "test-node");
        assert_ne!(node.local_addr().port(), 0);
        assert!(node.security.is_none());

        let direct = node.registry.direct_peers().await;
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].node_id, "direct:10.0.0.9:7520");

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_peer_host_names_are_resolved() {
        let peer = resolve_direct_peer("http://localhost:7600/run").await.unwrap();
        assert!(peer.ip.is_loopback());
        assert_eq!(peer.port, 7600);
        assert_eq!(peer.node_id, format!("direct:{}", peer.socket_addr()));

        let literal = resolve_direct_peer("10.0.0.9").await.unwrap();
        assert_eq!(literal.node_id, "direct:10.0.0.9:7520");

        assert!(resolve_direct_peer("ftp://localhost").await.is_err());

        let mut config = local_config();
        config.discovery.static_peers = vec!["localhost:7601".into()];
        let node = start_node(config).await.unwrap();
        let direct = node.registry.direct_peers().await;
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].port, 7601);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_secret_enables_security() {
        let mut config = local_config();
        config.security.shared_secret = Some("s3cret".into());
        let node = start_node(config).await.unwrap();
        assert_eq!(node.security.as_ref().unwrap().node_id(), "test-node");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_listen_address() {
        let mut config = local_config();
        config.node.listen_address = "not an address".into();
        assert!(start_node(config).await.is_err());
    }
}
