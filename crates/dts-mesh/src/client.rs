use async_trait::async_trait;
use dts_config::DispatchConfig;
use dts_identity::{SealedTask, SecurityError};
use dts_types::protocol::{
    CONTENT_TYPE_SEALED, CPU_PATH, HEALTH_PATH, PROJECT_INFO_PATH, RUN_PATH, SIGNATURE_HEADER,
};
use dts_types::{CpuResponse, ErrorBody, HealthResponse, Peer, ProjectIdentity, RunResponse, Task};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Peer answered {code}: {message}")]
    Status { code: u16, message: String },
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),
}

impl ClientError {
    /// Whether another attempt at the same peer could succeed. Rejections
    /// (400, 403, 404, 413) and task failures (500) are deterministic.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout(_) | ClientError::Connect(_) => true,
            ClientError::Status { code, .. } => !matches!(code, 400 | 403 | 404 | 413 | 500),
            ClientError::Decode(_) | ClientError::Security(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ClientError::Timeout(_) => "timeout",
            ClientError::Connect(_) => "connect",
            ClientError::Status { code: 500, .. } => "execution",
            ClientError::Status { .. } => "status",
            ClientError::Decode(_) => "decode",
            ClientError::Security(_) => "security",
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout(e.to_string())
        } else if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Connect(e.to_string())
        }
    }
}

/// Body of a `/run` request.
#[derive(Debug, Clone)]
pub enum RunRequest {
    /// Development mode: the task as JSON.
    Plain(Task),
    Sealed(SealedTask),
}

/// Outbound calls to a peer's executor.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn project_info(&self, peer: &Peer) -> Result<ProjectIdentity, ClientError>;

    /// Instantaneous CPU usage in percent.
    async fn cpu_usage(&self, peer: &Peer) -> Result<f64, ClientError>;

    async fn health(&self, peer: &Peer) -> Result<(), ClientError>;

    async fn submit(&self, peer: &Peer, request: &RunRequest) -> Result<RunResponse, ClientError>;

    /// Whether the wider network is reachable at all.
    async fn wan_reachable(&self) -> bool;
}

/// `reqwest` implementation of [`PeerClient`].
#[derive(Clone)]
pub struct HttpPeerClient {
    probe: Client,
    dispatch: Client,
    wan_probe_address: String,
    wan_probe_timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(config: &DispatchConfig) -> Result<Self, ClientError> {
        let probe = Client::builder()
            .timeout(config.probe_timeout())
            .connect_timeout(config.probe_timeout())
            .build()?;
        let dispatch = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            probe,
            dispatch,
            wan_probe_address: config.wan_probe_address.clone(),
            wan_probe_timeout: config.wan_probe_timeout(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, peer: &Peer, path: &str) -> Result<T, ClientError> {
        let response = self.probe.get(peer.endpoint(path)).send().await?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(|e| ClientError::Decode(e.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(ClientError::Status {
        code: status.as_u16(),
        message,
    })
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn project_info(&self, peer: &Peer) -> Result<ProjectIdentity, ClientError> {
        self.get_json(peer, PROJECT_INFO_PATH).await
    }

    async fn cpu_usage(&self, peer: &Peer) -> Result<f64, ClientError> {
        let body: CpuResponse = self.get_json(peer, CPU_PATH).await?;
        Ok(body.usage)
    }

    async fn health(&self, peer: &Peer) -> Result<(), ClientError> {
        let body: HealthResponse = self.get_json(peer, HEALTH_PATH).await?;
        if body.status == "ok" {
            Ok(())
        } else {
            Err(ClientError::Decode(format!("unexpected health status {}", body.status)))
        }
    }

    async fn submit(&self, peer: &Peer, request: &RunRequest) -> Result<RunResponse, ClientError> {
        let url = peer.endpoint(RUN_PATH);
        let builder = match request {
            RunRequest::Plain(task) => self.dispatch.post(&url).json(task),
            RunRequest::Sealed(sealed) => self
                .dispatch
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_SEALED)
                .header(SIGNATURE_HEADER, sealed.signature_hex.as_str())
                .body(sealed.body.clone()),
        };
        debug!(%url, "Submitting task");
        let response = check_status(builder.send().await?).await?;
        response
            .json::<RunResponse>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn wan_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(self.wan_probe_timeout, TcpStream::connect(self.wan_probe_address.as_str())).await,
            Ok(Ok(_))
        )
    }
}
