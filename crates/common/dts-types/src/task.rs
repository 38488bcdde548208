use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A unit of work that can run locally or on a peer.
///
/// Development clients may post only `{func, args, kwargs}`; every other
/// field falls back to its default. `signature` and `sender_public_key` are
/// only present once the task has been signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Best-effort unique id, `"{func}_{unix seconds}"`
    #[serde(default)]
    pub task_id: String,

    /// Name of the registered task function
    pub func: String,

    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    /// Node that created the task
    #[serde(default)]
    pub sender_id: String,

    /// Complexity estimate computed by the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,

    /// Base64 Ed25519 signature over the canonical task bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// PEM-encoded public key of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<String>,
}

impl Task {
    pub fn new(
        func: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        sender_id: impl Into<String>,
    ) -> Self {
        let func = func.into();
        Self {
            task_id: generate_task_id(&func),
            func,
            args,
            kwargs,
            sender_id: sender_id.into(),
            complexity: None,
            signature: None,
            sender_public_key: None,
        }
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Drop the signature fields once the task has been authenticated.
    pub fn strip_signature(&mut self) {
        self.signature = None;
        self.sender_public_key = None;
    }
}

/// Ids are derived from the wall clock, so two tasks created within the same
/// microsecond share an id.
pub fn generate_task_id(func: &str) -> String {
    let micros = Utc::now().timestamp_micros();
    format!("{}_{}.{:06}", func, micros.div_euclid(1_000_000), micros.rem_euclid(1_000_000))
}
