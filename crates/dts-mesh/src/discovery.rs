//! Service advertisement and browsing.
//!
//! Nodes announce their executor as `_tasknode._tcp.local.` with TXT
//! properties `node_id` and `load`. The load is embedded at announcement time,
//! so announcers re-advertise periodically through [`Registration::update_load`].

use chrono::Utc;
use dts_types::Peer;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_tasknode._tcp.local.";

const LOAD_PROPERTY: &str = "load";
const NODE_ID_PROPERTY: &str = "node_id";
const FORWARD_POLL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),
    #[error("Invalid service announcement: {0}")]
    InvalidAnnouncement(String),
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(e: mdns_sd::Error) -> Self {
        DiscoveryError::Daemon(e.to_string())
    }
}

/// What a node publishes about its executor, and what browsers resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub node_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub load: f64,
}

impl Announcement {
    pub fn new(node_id: impl Into<String>, ip: IpAddr, port: u16, load: f64) -> Self {
        Self {
            node_id: node_id.into(),
            ip,
            port,
            load,
        }
    }

    pub fn into_peer(self) -> Peer {
        Peer {
            node_id: self.node_id,
            ip: self.ip,
            port: self.port,
            load: self.load,
            last_seen: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Resolved(Announcement),
    /// A service went away. Carries the backend's instance name.
    Removed { name: String },
}

/// Backend that can publish this node and browse for others.
pub trait ServiceDiscovery: Send + Sync {
    /// Publish or refresh an announcement. Announcing the same node id again
    /// replaces the previous announcement.
    fn advertise(&self, announcement: &Announcement) -> Result<(), DiscoveryError>;

    fn withdraw(&self, node_id: &str) -> Result<(), DiscoveryError>;

    /// Start browsing. Browsing stops once the receiver is dropped.
    fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError>;
}

/// DNS labels allow letters, digits and hyphens.
fn instance_label(node_id: &str) -> String {
    let label: String = node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(63)
        .collect();
    if label.is_empty() {
        "dts-node".to_string()
    } else {
        label
    }
}

/// Multicast DNS backend.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    registered: Mutex<HashMap<String, String>>,
}

impl MdnsDiscovery {
    pub fn new(service_type: impl Into<String>) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            service_type: service_type.into(),
            registered: Mutex::new(HashMap::new()),
        })
    }

    fn announcement_from_info(info: &ServiceInfo) -> Option<Announcement> {
        let addresses: Vec<IpAddr> = info.get_addresses().iter().map(|addr| (*addr).into()).collect();
        let ip = addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addresses.first())
            .copied()?;

        let node_id = info
            .get_property_val_str(NODE_ID_PROPERTY)
            .map(str::to_string)
            .unwrap_or_else(|| info.get_fullname().to_string());
        let load = info
            .get_property_val_str(LOAD_PROPERTY)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);

        Some(Announcement {
            node_id,
            ip,
            port: info.get_port(),
            load,
        })
    }
}

impl ServiceDiscovery for MdnsDiscovery {
    fn advertise(&self, announcement: &Announcement) -> Result<(), DiscoveryError> {
        let label = instance_label(&announcement.node_id);
        let host = format!("{}.local.", label);
        let properties = HashMap::from([
            (LOAD_PROPERTY.to_string(), format!("{:.4}", announcement.load)),
            (NODE_ID_PROPERTY.to_string(), announcement.node_id.clone()),
        ]);

        let info = ServiceInfo::new(
            &self.service_type,
            &label,
            &host,
            announcement.ip.to_string().as_str(),
            announcement.port,
            properties,
        )
        .map_err(|e| DiscoveryError::InvalidAnnouncement(e.to_string()))?;

        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        self.registered
            .lock()
            .insert(announcement.node_id.clone(), fullname);
        debug!(node_id = %announcement.node_id, load = announcement.load, "Advertised executor");
        Ok(())
    }

    fn withdraw(&self, node_id: &str) -> Result<(), DiscoveryError> {
        let fullname = self.registered.lock().remove(node_id);
        if let Some(fullname) = fullname {
            self.daemon.unregister(&fullname)?;
            info!(node_id, "Withdrew executor advertisement");
        }
        Ok(())
    }

    fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError> {
        let receiver = self.daemon.browse(&self.service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let daemon = self.daemon.clone();
        let service_type = self.service_type.clone();

        std::thread::Builder::new()
            .name("dts-mdns-browse".to_string())
            .spawn(move || {
                loop {
                    if tx.is_closed() {
                        break;
                    }
                    let event = match receiver.recv_timeout(FORWARD_POLL) {
                        Ok(event) => event,
                        Err(_) if receiver.is_disconnected() => break,
                        Err(_) => continue,
                    };
                    let forwarded = match event {
                        ServiceEvent::ServiceResolved(info) => match Self::announcement_from_info(&info) {
                            Some(announcement) => tx.send(DiscoveryEvent::Resolved(announcement)),
                            None => {
                                debug!(fullname = %info.get_fullname(), "Resolved service without address");
                                Ok(())
                            }
                        },
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            tx.send(DiscoveryEvent::Removed { name: fullname })
                        }
                        _ => Ok(()),
                    };
                    if forwarded.is_err() {
                        break;
                    }
                }
                if let Err(e) = daemon.stop_browse(&service_type) {
                    debug!(error = %e, "Failed to stop mDNS browse");
                }
            })
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        Ok(rx)
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}

/// In-process discovery bus with the same semantics as [`MdnsDiscovery`].
#[derive(Clone, Default)]
pub struct MemoryDiscovery {
    inner: Arc<Mutex<MemoryBus>>,
}

#[derive(Default)]
struct MemoryBus {
    announcements: HashMap<String, Announcement>,
    subscribers: Vec<mpsc::UnboundedSender<DiscoveryEvent>>,
}

impl MemoryBus {
    fn publish(&mut self, event: DiscoveryEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announcements(&self) -> Vec<Announcement> {
        self.inner.lock().announcements.values().cloned().collect()
    }
}

impl ServiceDiscovery for MemoryDiscovery {
    fn advertise(&self, announcement: &Announcement) -> Result<(), DiscoveryError> {
        if !announcement.load.is_finite() {
            return Err(DiscoveryError::InvalidAnnouncement(format!(
                "load {} for {}",
                announcement.load, announcement.node_id
            )));
        }
        let mut bus = self.inner.lock();
        bus.announcements
            .insert(announcement.node_id.clone(), announcement.clone());
        bus.publish(DiscoveryEvent::Resolved(announcement.clone()));
        Ok(())
    }

    fn withdraw(&self, node_id: &str) -> Result<(), DiscoveryError> {
        let mut bus = self.inner.lock();
        if bus.announcements.remove(node_id).is_some() {
            bus.publish(DiscoveryEvent::Removed {
                name: instance_label(node_id),
            });
        }
        Ok(())
    }

    fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bus = self.inner.lock();
        for announcement in bus.announcements.values() {
            // The receiver is still in hand, so these sends cannot fail.
            let _ = tx.send(DiscoveryEvent::Resolved(announcement.clone()));
        }
        bus.subscribers.push(tx);
        Ok(rx)
    }
}

/// Browse for up to `timeout` and return the peers seen, one per node id
/// (latest announcement wins), ordered by advertised load.
pub async fn discover(discovery: &dyn ServiceDiscovery, timeout: Duration) -> Result<Vec<Peer>, DiscoveryError> {
    let mut events = discovery.browse()?;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut found: HashMap<String, Peer> = HashMap::new();
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(DiscoveryEvent::Resolved(announcement)) => {
                    found.insert(announcement.node_id.clone(), announcement.into_peer());
                }
                Some(DiscoveryEvent::Removed { name }) => {
                    debug!(%name, "Service removed");
                }
                None => break,
            },
        }
    }

    let mut peers: Vec<Peer> = found.into_values().collect();
    peers.sort_by(|a, b| a.load.total_cmp(&b.load));
    Ok(peers)
}

/// Keeps this node's advertisement alive. Dropping it withdraws the
/// advertisement.
pub struct Registration {
    discovery: Arc<dyn ServiceDiscovery>,
    announcement: Mutex<Announcement>,
    withdrawn: Mutex<bool>,
}

impl Registration {
    pub fn announcement(&self) -> Announcement {
        self.announcement.lock().clone()
    }

    /// Re-advertise with a fresh load value.
    pub fn update_load(&self, load: f64) -> Result<(), DiscoveryError> {
        let announcement = {
            let mut current = self.announcement.lock();
            current.load = load;
            current.clone()
        };
        self.discovery.advertise(&announcement)
    }

    pub fn withdraw(&self) -> Result<(), DiscoveryError> {
        let mut withdrawn = self.withdrawn.lock();
        if *withdrawn {
            return Ok(());
        }
        *withdrawn = true;
        let node_id = self.announcement.lock().node_id.clone();
        self.discovery.withdraw(&node_id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = self.withdraw() {
            warn!(error = %e, "Failed to withdraw advertisement");
        }
    }
}

/// Advertise this node's executor.
pub fn register(
    discovery: Arc<dyn ServiceDiscovery>,
    node_id: &str,
    ip: IpAddr,
    port: u16,
    load: f64,
) -> Result<Registration, DiscoveryError> {
    let announcement = Announcement::new(node_id, ip, port, load);
    discovery.advertise(&announcement)?;
    info!(node_id, %ip, port, "Registered executor for discovery");
    Ok(Registration {
        discovery,
        announcement: Mutex::new(announcement),
        withdrawn: Mutex::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lan(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    #[tokio::test]
    async fn test_discover_dedupes_by_node_id() {
        let bus = MemoryDiscovery::new();
        bus.advertise(&Announcement::new("node-a", lan(10), 7520, 0.9)).unwrap();
        bus.advertise(&Announcement::new("node-b", lan(11), 7520, 0.1)).unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            // Load change for the same node: latest wins, no duplicate entry.
            publisher
                .advertise(&Announcement::new("node-a", lan(10), 7520, 0.3))
                .unwrap();
        });

        let peers = discover(&bus, Duration::from_millis(150)).await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, "node-b");
        assert_eq!(peers[1].node_id, "node-a");
        assert_eq!(peers[1].load, 0.3);
    }

    #[tokio::test]
    async fn test_discover_empty_is_ok() {
        let bus = MemoryDiscovery::new();
        let peers = discover(&bus, Duration::from_millis(20)).await.unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_discover_sees_late_announcements() {
        let bus = MemoryDiscovery::new();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .advertise(&Announcement::new("late", lan(20), 7600, 0.5))
                .unwrap();
        });

        let peers = discover(&bus, Duration::from_millis(200)).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 7600);
    }

    #[tokio::test]
    async fn test_registration_lifecycle() {
        let bus = MemoryDiscovery::new();
        let shared: Arc<dyn ServiceDiscovery> = Arc::new(bus.clone());
        let mut events = bus.browse().unwrap();

        let registration = register(shared, "node-a", lan(10), 7520, 0.2).unwrap();
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Resolved(a)) if a.load == 0.2));

        registration.update_load(0.7).unwrap();
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Resolved(a)) if a.load == 0.7));
        assert_eq!(registration.announcement().load, 0.7);

        drop(registration);
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Removed { name }) if name == "node-a"));
        assert!(bus.announcements().is_empty());
    }

    #[test]
    fn test_instance_label() {
        assert_eq!(instance_label("worker_1.lan"), "worker-1-lan");
        assert_eq!(instance_label(""), "dts-node");
    }

    #[test]
    fn test_memory_rejects_non_finite_load() {
        let bus = MemoryDiscovery::new();
        assert!(bus.advertise(&Announcement::new("x", lan(1), 1, f64::NAN)).is_err());
    }
}
