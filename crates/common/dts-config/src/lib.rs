use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the path of the node configuration file.
pub const CONFIG_PATH_ENV: &str = "DTS_NODE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "dts_node.toml";

pub const SHARED_SECRET_ENV: &str = "DTS_SHARED_SECRET";
pub const LEGACY_SHARED_SECRET_ENV: &str = "SHARED_SECRET";
pub const REMOTE_SERVER_ENV: &str = "REMOTE_SERVER";
pub const NODE_ID_ENV: &str = "NODE_ID";

/// Top-level node configuration. Every section is optional in the TOML file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub security: SecurityConfig,
    pub discovery: DiscoveryConfig,
    pub policy: PolicyConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NodeSection {
    /// Node identity; falls back to the host name
    pub node_id: Option<String>,
    /// Executor listen address
    pub listen_address: String,
    /// Address advertised to peers; detected from the routing table when unset
    pub advertise_address: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_address: "0.0.0.0:7520".to_string(),
            advertise_address: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    /// Pre-shared secret; without one the node runs in development mode
    pub shared_secret: Option<String>,
    pub kdf_iterations: u32,
    /// Accept unsigned plaintext tasks even when a secret is configured
    pub allow_plaintext: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            kdf_iterations: 150_000,
            allow_plaintext: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub service_type: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Defaults to three discovery intervals
    pub stale_after_secs: Option<u64>,
    /// Defaults to ten discovery intervals
    pub evict_after_secs: Option<u64>,
    /// Peers reached directly instead of through multicast discovery, as
    /// `http://host:port[/run]`. Host names are resolved once at start-up.
    pub static_peers: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: "_tasknode._tcp.local.".to_string(),
            interval_secs: 10,
            timeout_secs: 3,
            stale_after_secs: None,
            evict_after_secs: None,
            static_peers: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs.unwrap_or(self.interval_secs.max(1) * 3))
    }

    pub fn evict_after(&self) -> Duration {
        Duration::from_secs(self.evict_after_secs.unwrap_or(self.interval_secs.max(1) * 10))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PolicyConfig {
    /// Rolling average CPU fraction above which tasks are offloaded
    pub cpu_threshold: f64,
    /// Complexity estimate above which tasks are offloaded
    pub complexity_ceiling: f64,
    /// Number of samples in the rolling window
    pub window: usize,
    /// Offload when average available memory drops below this many MB
    pub memory_floor_mb: Option<f64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 0.6,
            complexity_ceiling: 50.0,
            window: 10,
            memory_floor_mb: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub probe_timeout_secs: u64,
    pub wan_probe_address: String,
    pub wan_probe_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            backoff_ms: 500,
            probe_timeout_secs: 2,
            wan_probe_address: "8.8.8.8:53".to_string(),
            wan_probe_timeout_secs: 3,
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn wan_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.wan_probe_timeout_secs)
    }
}

impl NodeConfig {
    /// Apply the process environment on top of the file configuration.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup, so callers (and tests) need
    /// not touch the real process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(secret) = non_empty(SHARED_SECRET_ENV).or_else(|| non_empty(LEGACY_SHARED_SECRET_ENV)) {
            self.security.shared_secret = Some(secret);
        }

        if let Some(node_id) = non_empty(NODE_ID_ENV) {
            self.node.node_id = Some(node_id);
        }

        if let Some(remote) = non_empty(REMOTE_SERVER_ENV) {
            for address in remote.split(',').map(str::trim).filter(|a| !a.is_empty()) {
                if !self.discovery.static_peers.iter().any(|p| p == address) {
                    self.discovery.static_peers.push(address.to_string());
                }
            }
        }
    }
}

pub fn parse_node_config(content: &str) -> anyhow::Result<NodeConfig> {
    toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))
}

/// Read and parse a node configuration file.
pub fn load_node_config(path: impl AsRef<Path>) -> anyhow::Result<NodeConfig> {
    let path = path.as_ref();
    let config_content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file from {}: {}", path.display(), e))?;
    toml::from_str(&config_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse TOML config from {}: {}", path.display(), e))
}
