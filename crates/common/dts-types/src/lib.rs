//! Common data structures shared by every crate of the distributed task system:
//! peers, tasks, the project identity fingerprint and the HTTP wire bodies.

pub mod peer;
pub mod project;
pub mod protocol;
pub mod task;

pub use peer::{is_lan_address, Peer, PeerParseError};
pub use project::ProjectIdentity;
pub use protocol::{CpuResponse, ErrorBody, HealthResponse, RunResponse};
pub use task::Task;
