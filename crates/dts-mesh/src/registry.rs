//! Peer cache and its periodic maintenance.

use crate::client::PeerClient;
use crate::discovery::{discover, Registration, ServiceDiscovery};
use crate::metrics::METRICS;
use crate::monitor::ResourceMonitor;
use chrono::{DateTime, Utc};
use dts_types::{Peer, ProjectIdentity};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cached view of one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub peer: Peer,
    /// `None` until `/project_info` has been checked
    pub compatible: Option<bool>,
    /// Configured directly rather than discovered
    pub direct: bool,
}

/// Known peers keyed by node id.
///
/// Incompatible and stale peers stay cached for diagnostics but are never
/// handed out by [`PeerRegistry::usable_peers`].
pub struct PeerRegistry {
    local_node_id: String,
    stale_after: chrono::Duration,
    evict_after: chrono::Duration,
    peers: RwLock<HashMap<String, PeerRecord>>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

impl PeerRegistry {
    pub fn new(local_node_id: impl Into<String>, stale_after: Duration, evict_after: Duration) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            stale_after: to_chrono(stale_after),
            evict_after: to_chrono(evict_after),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Insert or refresh a discovered peer. Returns true for a new node.
    /// A peer that moved to a new address must be checked again.
    pub async fn upsert(&self, peer: Peer) -> bool {
        if peer.node_id == self.local_node_id {
            return false;
        }
        let mut peers = self.peers.write().await;
        match peers.get_mut(&peer.node_id) {
            Some(record) => {
                if record.peer.socket_addr() != peer.socket_addr() {
                    debug!(node_id = %peer.node_id, addr = %peer.socket_addr(), "Peer moved, re-checking compatibility");
                    record.compatible = None;
                }
                record.peer.ip = peer.ip;
                record.peer.port = peer.port;
                record.peer.load = peer.load;
                record.peer.last_seen = peer.last_seen.max(record.peer.last_seen);
                false
            }
            None => {
                info!(node_id = %peer.node_id, addr = %peer.socket_addr(), load = peer.load, "Discovered peer");
                peers.insert(
                    peer.node_id.clone(),
                    PeerRecord {
                        peer,
                        compatible: None,
                        direct: false,
                    },
                );
                true
            }
        }
    }

    /// Merge a discovery snapshot. Returns the number of new peers.
    pub async fn merge(&self, snapshot: Vec<Peer>) -> usize {
        let mut added = 0;
        for peer in snapshot {
            if self.upsert(peer).await {
                added += 1;
            }
        }
        added
    }

    /// Add a configured peer. Direct peers are never evicted.
    pub async fn register_direct(&self, peer: Peer) {
        if peer.node_id == self.local_node_id {
            return;
        }
        let mut peers = self.peers.write().await;
        let record = peers.entry(peer.node_id.clone()).or_insert_with(|| PeerRecord {
            peer: peer.clone(),
            compatible: None,
            direct: true,
        });
        record.direct = true;
        info!(node_id = %peer.node_id, addr = %peer.socket_addr(), "Registered direct peer");
    }

    pub async fn set_compatibility(&self, node_id: &str, compatible: bool) {
        if let Some(record) = self.peers.write().await.get_mut(node_id) {
            record.compatible = Some(compatible);
        }
    }

    /// Mark a peer as seen now. Returns false for unknown peers.
    pub async fn touch(&self, node_id: &str) -> bool {
        match self.peers.write().await.get_mut(node_id) {
            Some(record) => {
                record.peer.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(node_id).cloned()
    }

    /// Fresh, compatible peers other than this node, least loaded first.
    pub async fn usable_peers(&self) -> Vec<Peer> {
        self.usable_peers_at(Utc::now()).await
    }

    pub async fn usable_peers_at(&self, now: DateTime<Utc>) -> Vec<Peer> {
        let peers = self.peers.read().await;
        let mut usable: Vec<Peer> = peers
            .values()
            .filter(|r| r.compatible == Some(true) && !r.peer.is_stale(now, self.stale_after))
            .map(|r| r.peer.clone())
            .collect();
        usable.sort_by(|a, b| a.load.total_cmp(&b.load));
        usable
    }

    /// Everything cached, including incompatible and stale peers.
    pub async fn all_peers(&self) -> Vec<PeerRecord> {
        let mut all: Vec<PeerRecord> = self.peers.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.peer.node_id.cmp(&b.peer.node_id));
        all
    }

    /// Fresh peers whose compatibility has not been established yet.
    pub async fn pending_verification(&self) -> Vec<Peer> {
        let now = Utc::now();
        self.peers
            .read()
            .await
            .values()
            .filter(|r| r.compatible.is_none() && !r.peer.is_stale(now, self.stale_after))
            .map(|r| r.peer.clone())
            .collect()
    }

    pub async fn direct_peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .await
            .values()
            .filter(|r| r.direct)
            .map(|r| r.peer.clone())
            .collect()
    }

    /// Drop discovered peers not seen for longer than the eviction age.
    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now()).await
    }

    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|node_id, record| {
            let keep = record.direct || !record.peer.is_stale(now, self.evict_after);
            if !keep {
                debug!(%node_id, "Evicting expired peer");
            }
            keep
        });
        before - peers.len()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

/// One round of peer upkeep: re-advertise, browse, probe, verify, sweep.
pub struct PeerMaintenance {
    pub registry: Arc<PeerRegistry>,
    pub discovery: Option<Arc<dyn ServiceDiscovery>>,
    pub registration: Option<Registration>,
    pub monitor: Arc<ResourceMonitor>,
    pub client: Arc<dyn PeerClient>,
    pub identity: ProjectIdentity,
    pub browse_timeout: Duration,
    pub probe_timeout: Duration,
}

impl PeerMaintenance {
    pub async fn refresh(&self) {
        if let Some(registration) = &self.registration {
            let load = self.monitor.current_load();
            if let Err(e) = registration.update_load(load) {
                warn!(error = %e, "Failed to refresh advertisement");
            }
        }

        if let Some(discovery) = &self.discovery {
            match discover(discovery.as_ref(), self.browse_timeout).await {
                Ok(snapshot) => {
                    let added = self.registry.merge(snapshot).await;
                    if added > 0 {
                        debug!(added, "Merged discovery snapshot");
                    }
                }
                Err(e) => warn!(error = %e, "Discovery round failed"),
            }
        }

        self.probe_direct_peers().await;
        self.verify_pending().await;

        let evicted = self.registry.evict_expired().await;
        if evicted > 0 {
            info!(evicted, "Evicted expired peers");
        }
        METRICS
            .usable_peers
            .set(self.registry.usable_peers().await.len() as i64);
    }

    async fn probe_direct_peers(&self) {
        let direct = self.registry.direct_peers().await;
        let probes = direct.iter().map(|peer| async move {
            let healthy = matches!(
                tokio::time::timeout(self.probe_timeout, self.client.health(peer)).await,
                Ok(Ok(()))
            );
            (peer, healthy)
        });
        for (peer, healthy) in join_all(probes).await {
            if healthy {
                self.registry.touch(&peer.node_id).await;
            } else {
                debug!(node_id = %peer.node_id, "Direct peer did not answer health probe");
            }
        }
    }

    /// Check `/project_info` of unverified peers. Unreachable peers stay
    /// pending and are retried next round.
    async fn verify_pending(&self) {
        let pending = self.registry.pending_verification().await;
        let checks = pending.iter().map(|peer| async move {
            let outcome = tokio::time::timeout(self.probe_timeout, self.client.project_info(peer)).await;
            (peer, outcome)
        });
        for (peer, outcome) in join_all(checks).await {
            match outcome {
                Ok(Ok(remote)) => {
                    let compatible = self.identity.is_compatible(&remote);
                    if compatible {
                        info!(node_id = %peer.node_id, "Peer is a compatible executor");
                    } else {
                        warn!(
                            node_id = %peer.node_id,
                            project = %remote.project_name,
                            version = %remote.version,
                            "Peer runs an incompatible project"
                        );
                    }
                    self.registry.set_compatibility(&peer.node_id, compatible).await;
                }
                Ok(Err(e)) => debug!(node_id = %peer.node_id, error = %e, "Compatibility check failed"),
                Err(_) => debug!(node_id = %peer.node_id, "Compatibility check timed out"),
            }
        }
    }
}

/// Background task running [`PeerMaintenance::refresh`] every interval.
pub struct DiscoveryLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DiscoveryLoop {
    pub fn spawn(maintenance: PeerMaintenance, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // A round in progress is abandoned on shutdown.
                tokio::select! {
                    _ = async {
                        ticker.tick().await;
                        maintenance.refresh().await;
                    } => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            if let Some(registration) = &maintenance.registration {
                if let Err(e) = registration.withdraw() {
                    warn!(error = %e, "Failed to withdraw advertisement on shutdown");
                }
            }
            info!("Discovery loop stopped");
        });
        Self { shutdown, handle }
    }

    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Discovery loop ended abnormally");
        }
    }
}
