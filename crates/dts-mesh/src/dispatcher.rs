use crate::client::{ClientError, PeerClient, RunRequest};
use crate::metrics::METRICS;
use crate::monitor::ResourceMonitor;
use crate::registry::PeerRegistry;
use crate::selector::PeerSelector;
use crate::tasks::{TaskError, TaskRegistry};
use dts_config::DispatchConfig;
use dts_identity::SecurityContext;
use dts_types::{Peer, Task};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Function not found: {0}")]
    FunctionNotFound(String),
    /// The task ran on a peer and failed there.
    #[error("Task failed on {host}: {message}")]
    Execution { host: String, message: String },
    #[error("Local execution failed: {0}")]
    Local(TaskError),
    #[error("Remote dispatch failed ({remote}) and local fallback failed ({local})")]
    Exhausted { remote: String, local: TaskError },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionLocation {
    Local,
    Remote { node_id: String, addr: SocketAddr },
}

/// Result of a task together with where and how long it ran.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: Value,
    pub host: String,
    pub elapsed: Duration,
    pub location: ExecutionLocation,
}

/// Runs tasks locally or on the best peer, transparently to the caller.
pub struct Dispatcher {
    node_id: String,
    host: String,
    tasks: Arc<TaskRegistry>,
    monitor: Arc<ResourceMonitor>,
    registry: Arc<PeerRegistry>,
    selector: PeerSelector,
    client: Arc<dyn PeerClient>,
    security: Option<Arc<SecurityContext>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        monitor: Arc<ResourceMonitor>,
        registry: Arc<PeerRegistry>,
        client: Arc<dyn PeerClient>,
        config: DispatchConfig,
    ) -> Self {
        let node_id = registry.local_node_id().to_string();
        Self {
            host: node_id.clone(),
            node_id,
            tasks,
            monitor,
            registry,
            selector: PeerSelector::new(client.clone(), config.probe_timeout()),
            client,
            security: None,
            config,
        }
    }

    /// Seal outgoing tasks. Without a context tasks travel as plain JSON.
    pub fn with_security(mut self, security: Arc<SecurityContext>) -> Self {
        self.security = Some(security);
        self
    }

    /// Host name reported for local executions.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub async fn invoke(&self, func: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, DispatchError> {
        self.invoke_detailed(func, args, kwargs).await.map(|e| e.result)
    }

    pub async fn invoke_detailed(
        &self,
        func: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Execution, DispatchError> {
        if !self.tasks.contains(func) {
            return Err(DispatchError::FunctionNotFound(func.to_string()));
        }
        let complexity = self.tasks.estimate(func, &args, &kwargs);

        let mut remote_failure = None;
        if self.monitor.should_offload(complexity) {
            let candidates = self.registry.usable_peers().await;
            match self.selector.select_peer(&candidates).await {
                Some(peer) => {
                    let task = Task::new(func, args.clone(), kwargs.clone(), self.node_id.clone()).with_complexity(complexity);
                    match self.run_remote(&peer, &task).await {
                        Ok(execution) => return Ok(execution),
                        Err(ClientError::Status { code: 500, message }) => {
                            return Err(DispatchError::Execution {
                                host: peer.node_id,
                                message,
                            });
                        }
                        Err(e) => {
                            warn!(%func, node_id = %peer.node_id, error = %e, "Offload failed, running locally");
                            remote_failure = Some(e.to_string());
                        }
                    }
                }
                None => debug!(%func, candidates = candidates.len(), "No peer available, running locally"),
            }
        }

        self.run_local(func, args, kwargs, remote_failure).await
    }

    async fn run_local(
        &self,
        func: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        remote_failure: Option<String>,
    ) -> Result<Execution, DispatchError> {
        let started = Instant::now();
        match self.tasks.execute_blocking(func.to_string(), args, kwargs).await {
            Ok(result) => {
                METRICS.local_executions.inc();
                Ok(Execution {
                    result,
                    host: self.host.clone(),
                    elapsed: started.elapsed(),
                    location: ExecutionLocation::Local,
                })
            }
            Err(local) => Err(match (remote_failure, local) {
                (Some(remote), local) => DispatchError::Exhausted { remote, local },
                (None, TaskError::NotFound(name)) => DispatchError::FunctionNotFound(name),
                (None, local) => DispatchError::Local(local),
            }),
        }
    }

    fn build_request(&self, task: &Task) -> Result<RunRequest, ClientError> {
        match &self.security {
            Some(security) => Ok(RunRequest::Sealed(security.seal_task(task)?)),
            None => Ok(RunRequest::Plain(task.clone())),
        }
    }

    /// Submit with retries and linear backoff. Deterministic rejections end
    /// the attempt at once.
    async fn run_remote(&self, peer: &Peer, task: &Task) -> Result<Execution, ClientError> {
        let request = self.build_request(task)?;
        let attempts = self.config.max_retries.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.config.timeout(), self.client.submit(peer, &request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Timeout(format!("no answer within {:?}", self.config.timeout()))),
            };

            match outcome {
                Ok(response) => {
                    METRICS.offloaded_tasks.inc();
                    info!(func = %task.func, node_id = %peer.node_id, attempt, "Task executed remotely");
                    return Ok(Execution {
                        result: response.result,
                        host: response.host,
                        // Peer-reported time; our own round trip when it is unusable.
                        elapsed: Duration::try_from_secs_f64(response.elapsed).unwrap_or_else(|_| started.elapsed()),
                        location: ExecutionLocation::Remote {
                            node_id: peer.node_id.clone(),
                            addr: peer.socket_addr(),
                        },
                    });
                }
                Err(e) => {
                    METRICS.dispatch_failures.with_label_values(&[e.reason()]).inc();
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(func = %task.func, node_id = %peer.node_id, attempt, attempts, error = %e, "Dispatch attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff() * attempt).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::Connect("no attempt made".to_string())))
    }
}
