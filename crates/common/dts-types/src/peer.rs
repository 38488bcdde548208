use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Port the executor listens on when an address does not name one.
pub const DEFAULT_EXECUTOR_PORT: u16 = 7520;

#[derive(Error, Debug, PartialEq)]
pub enum PeerParseError {
    #[error("Unsupported scheme in peer address: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),
}

/// Another node's advertised task-execution endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    /// Stable identity of the node; `ip:port` may change across restarts
    pub node_id: String,

    /// Address the executor was announced on
    pub ip: IpAddr,

    /// Executor port
    pub port: u16,

    /// Advertised CPU load as a fraction (0.0 - 1.0)
    pub load: f64,

    /// When this peer was last announced or probed
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn new(node_id: impl Into<String>, ip: IpAddr, port: u16, load: f64) -> Self {
        Self {
            node_id: node_id.into(),
            ip,
            port,
            load,
            last_seen: Utc::now(),
        }
    }

    /// Build a peer from a direct address such as `http://10.0.0.4:7520/run`.
    ///
    /// Direct peers have no advertised identity, so the node id is derived
    /// from the socket address.
    pub fn from_url(url: &str) -> Result<Self, PeerParseError> {
        let authority = authority_of(url)?;
        let addr = match authority.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let ip = authority
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse::<IpAddr>()
                    .map_err(|_| PeerParseError::InvalidAddress(url.to_string()))?;
                SocketAddr::new(ip, DEFAULT_EXECUTOR_PORT)
            }
        };

        Ok(Self::new(format!("direct:{}", addr), addr.ip(), addr.port(), 0.0))
    }

    /// `host:port` of a direct address, with the default port filled in.
    /// Unlike [`Peer::from_url`] the host may be a name, left for the caller
    /// to resolve.
    pub fn direct_authority(url: &str) -> Result<String, PeerParseError> {
        let authority = authority_of(url)?;
        let has_port = authority
            .rsplit_once(':')
            .map(|(host, port)| {
                !host.is_empty() && port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
            })
            .unwrap_or(false);
        Ok(if has_port {
            authority.to_string()
        } else if authority.contains(':') && !authority.starts_with('[') {
            format!("[{}]:{}", authority, DEFAULT_EXECUTOR_PORT)
        } else {
            format!("{}:{}", authority, DEFAULT_EXECUTOR_PORT)
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// `http://ip:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.socket_addr())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Whether the peer lives on the local network.
    pub fn is_lan(&self) -> bool {
        is_lan_address(&self.ip)
    }

    /// A peer is stale once it has not been seen for longer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.last_seen) > threshold
    }
}

/// Authority part of `http://authority/path`; the scheme is optional.
fn authority_of(url: &str) -> Result<&str, PeerParseError> {
    let trimmed = url.trim();
    let rest = match trimmed.split_once("://") {
        Some(("http", rest)) => rest,
        Some((scheme, _)) => return Err(PeerParseError::UnsupportedScheme(scheme.to_string())),
        None => trimmed,
    };
    match rest.split('/').next() {
        Some(authority) if !authority.is_empty() => Ok(authority),
        _ => Err(PeerParseError::InvalidAddress(url.to_string())),
    }
}

/// Private ranges (10/8, 172.16/12, 192.168/16) and loopback count as LAN.
/// For IPv6, loopback, unique-local (fc00::/7) and link-local (fe80::/10).
pub fn is_lan_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.is_private() || v4.is_loopback();
            }
            let first = v6.segments()[0];
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_lan_classification() {
        let lan = ["10.1.2.3", "172.16.0.1", "172.31.255.254", "192.168.1.20", "127.0.0.1", "::1", "fd00::1", "fe80::1"];
        for ip in lan {
            assert!(is_lan_address(&ip.parse().unwrap()), "{} should be LAN", ip);
        }

        let wan = ["8.8.8.8", "172.32.0.1", "172.15.0.1", "89.111.171.92", "2001:4860:4860::8888"];
        for ip in wan {
            assert!(!is_lan_address(&ip.parse().unwrap()), "{} should be WAN", ip);
        }
    }

    #[test]
    fn test_from_url_variants() {
        let peer = Peer::from_url("http://89.111.171.92:7520/run").unwrap();
        assert_eq!(peer.ip, IpAddr::V4(Ipv4Addr::new(89, 111, 171, 92)));
        assert_eq!(peer.port, 7520);
        assert_eq!(peer.node_id, "direct:89.111.171.92:7520");

        let bare = Peer::from_url("192.168.0.9").unwrap();
        assert_eq!(bare.port, DEFAULT_EXECUTOR_PORT);

        let v6 = Peer::from_url("http://[::1]:9000").unwrap();
        assert_eq!(v6.ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(v6.base_url(), "http://[::1]:9000");

        assert!(matches!(Peer::from_url("https://10.0.0.1:7520"), Err(PeerParseError::UnsupportedScheme(_))));
        assert!(matches!(Peer::from_url("http://not-an-ip:7520"), Err(PeerParseError::InvalidAddress(_))));
    }

    #[test]
    fn test_direct_authority_keeps_host_names() {
        assert_eq!(Peer::direct_authority("http://worker-3.lan:7600/run").unwrap(), "worker-3.lan:7600");
        assert_eq!(Peer::direct_authority("worker-3.lan").unwrap(), "worker-3.lan:7520");
        assert_eq!(Peer::direct_authority("http://10.0.0.1").unwrap(), "10.0.0.1:7520");
        assert_eq!(Peer::direct_authority("http://[::1]:9000").unwrap(), "[::1]:9000");
        assert_eq!(Peer::direct_authority("::1").unwrap(), "[::1]:7520");
        assert!(matches!(
            Peer::direct_authority("https://worker-3.lan"),
            Err(PeerParseError::UnsupportedScheme(_))
        ));
        assert!(matches!(Peer::direct_authority("http:///run"), Err(PeerParseError::InvalidAddress(_))));
    }

    #[test]
    fn test_staleness() {
        let mut peer = Peer::new("node-a", "10.0.0.2".parse().unwrap(), 7520, 0.2);
        let now = Utc::now();
        peer.last_seen = now - Duration::seconds(45);

        assert!(peer.is_stale(now, Duration::seconds(30)));
        assert!(!peer.is_stale(now, Duration::seconds(60)));
    }

    #[test]
    fn test_endpoint() {
        let peer = Peer::new("node-a", "10.0.0.2".parse().unwrap(), 7600, 0.0);
        assert_eq!(peer.endpoint("/cpu"), "http://10.0.0.2:7600/cpu");
    }
}
