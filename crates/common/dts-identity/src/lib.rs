//! Node-level cryptography for task exchange: a symmetric key shared by all
//! nodes of a deployment, a per-process Ed25519 identity and trust-on-first-use
//! pinning of peer keys.

pub mod canonical;
pub mod security;

pub use canonical::canonical_task_bytes;
pub use security::{derive_key, SealedTask, SecurityContext, SecurityError, DEFAULT_KDF_ITERATIONS};
