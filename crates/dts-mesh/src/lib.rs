#![deny(unsafe_code)]
//! Task offloading mesh for the distributed task system
//!
//! This crate provides the engine that decides where a task runs:
//! - Local load sampling and the offload policy
//! - Peer discovery over multicast DNS and the peer registry
//! - LAN-first peer selection
//! - Signed and encrypted dispatch with retries and local fallback

pub mod client;
pub mod discovery;
pub mod dispatcher;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod selector;
pub mod tasks;

// Re-export common types
pub use client::{ClientError, HttpPeerClient, PeerClient, RunRequest};
pub use discovery::{
    discover, register, Announcement, DiscoveryError, DiscoveryEvent, MdnsDiscovery, MemoryDiscovery, Registration,
    ServiceDiscovery, SERVICE_TYPE,
};
pub use dispatcher::{DispatchError, Dispatcher, Execution, ExecutionLocation};
pub use monitor::{LoadAverage, LoadSample, LoadSampler, MonitorError, Recommendation, ResourceMonitor, SystemSampler};
pub use registry::{DiscoveryLoop, PeerMaintenance, PeerRecord, PeerRegistry};
pub use selector::PeerSelector;
pub use tasks::{TaskError, TaskRegistry};
