//! HTTP bodies exchanged between nodes.
//!
//! `POST /run` accepts either a JSON [`Task`](crate::Task) (development mode)
//! or an encrypted task (`application/octet-stream`, hex signature in
//! [`SIGNATURE_HEADER`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RUN_PATH: &str = "/run";
pub const HEALTH_PATH: &str = "/health";
pub const CPU_PATH: &str = "/cpu";
pub const PROJECT_INFO_PATH: &str = "/project_info";
pub const METRICS_PATH: &str = "/metrics";

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_SEALED: &str = "application/octet-stream";

/// Successful execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResponse {
    pub result: Value,
    /// Host name of the executing node
    pub host: String,
    /// Execution time in seconds
    #[serde(rename = "took", alias = "elapsed")]
    pub elapsed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self { status: "ok".to_string() }
    }
}

/// Instantaneous CPU usage in percent (0 - 100).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuResponse {
    pub usage: f64,
}
