//! Node service for the distributed task system: the HTTP executor plus the
//! wiring that starts discovery and the dispatcher.

pub mod node;
pub mod server;

pub use node::{run_node, start_node, NodeHandle};
pub use server::{start_api_server, ApiHandle, ExecutorState};
