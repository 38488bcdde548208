use crate::client::PeerClient;
use dts_types::Peer;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// LAN-first choice of an execution target.
pub struct PeerSelector {
    client: Arc<dyn PeerClient>,
    probe_timeout: Duration,
}

impl PeerSelector {
    pub fn new(client: Arc<dyn PeerClient>, probe_timeout: Duration) -> Self {
        Self {
            client,
            probe_timeout,
        }
    }

    /// Pick the least-loaded responsive LAN peer. WAN peers are considered
    /// only when no LAN peer answers and the wider network is reachable.
    /// `None` means run locally.
    pub async fn select_peer(&self, peers: &[Peer]) -> Option<Peer> {
        if peers.is_empty() {
            return None;
        }
        let (lan, wan): (Vec<Peer>, Vec<Peer>) = peers.iter().cloned().partition(Peer::is_lan);

        if let Some(peer) = self.best_of(&lan).await {
            info!(node_id = %peer.node_id, load = peer.load, "Selected LAN peer");
            return Some(peer);
        }
        if wan.is_empty() {
            return None;
        }
        if !self.client.wan_reachable().await {
            debug!("Wider network unreachable, skipping WAN peers");
            return None;
        }
        let peer = self.best_of(&wan).await?;
        info!(node_id = %peer.node_id, load = peer.load, "Selected WAN peer");
        Some(peer)
    }

    /// Probe every peer's `/cpu` concurrently and return the lowest reported
    /// load. Peers that fail or time out are left out of this round only. The
    /// returned peer carries the probed load as a fraction.
    pub async fn best_of(&self, peers: &[Peer]) -> Option<Peer> {
        let probes = peers.iter().map(|peer| async move {
            match tokio::time::timeout(self.probe_timeout, self.client.cpu_usage(peer)).await {
                Ok(Ok(usage)) if usage.is_finite() => Some((peer, usage)),
                Ok(Ok(usage)) => {
                    debug!(node_id = %peer.node_id, usage, "Ignoring non-finite load report");
                    None
                }
                Ok(Err(e)) => {
                    debug!(node_id = %peer.node_id, error = %e, "Load probe failed");
                    None
                }
                Err(_) => {
                    debug!(node_id = %peer.node_id, "Load probe timed out");
                    None
                }
            }
        });

        join_all(probes)
            .await
            .into_iter()
            .flatten()
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(peer, usage)| {
                let mut chosen = peer.clone();
                chosen.load = usage / 100.0;
                chosen
            })
    }
}
