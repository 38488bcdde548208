use serde::{Deserialize, Serialize};

pub const PROJECT_NAME: &str = "distributed-task-system";
pub const PROJECT_VERSION: &str = "1.0";
pub const PROJECT_SIGNATURE: &str = "DTS_2024_SMART_DISTRIBUTION";

/// Static descriptor served on `/project_info`.
///
/// A peer is only trusted as an executor when its descriptor matches ours on
/// name, version and signature; this keeps unrelated HTTP services that
/// happen to answer on the executor port out of the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectIdentity {
    pub project_name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub features: Vec<String>,
    pub signature: String,
}

impl ProjectIdentity {
    pub fn new(features: Vec<String>) -> Self {
        Self {
            features,
            ..Self::default()
        }
    }

    pub fn is_compatible(&self, remote: &ProjectIdentity) -> bool {
        self.project_name == remote.project_name
            && self.version == remote.version
            && self.signature == remote.signature
    }
}

impl Default for ProjectIdentity {
    fn default() -> Self {
        Self {
            project_name: PROJECT_NAME.to_string(),
            version: PROJECT_VERSION.to_string(),
            description: "Smart task distribution".to_string(),
            author: "DTS Team".to_string(),
            features: Vec::new(),
            signature: PROJECT_SIGNATURE.to_string(),
        }
    }
}
