#![allow(dead_code)]

use dts_config::PolicyConfig;
use dts_identity::SecurityContext;
use dts_mesh::{LoadSample, LoadSampler, MonitorError, ResourceMonitor, TaskError, TaskRegistry};
use dts_node::{start_api_server, ApiHandle, ExecutorState};
use dts_types::{Peer, ProjectIdentity};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const SECRET: &str = "integration-secret";

/// Sampler reporting a constant CPU fraction.
pub struct FixedSampler(pub f64);

impl LoadSampler for FixedSampler {
    fn sample(&self) -> Result<LoadSample, MonitorError> {
        Ok(LoadSample {
            cpu: self.0,
            mem_available_mb: 4096.0,
        })
    }
}

pub fn monitor(cpu: f64) -> Arc<ResourceMonitor> {
    Arc::new(ResourceMonitor::new(Arc::new(FixedSampler(cpu)), PolicyConfig::default()))
}

/// Low iteration count keeps key derivation fast in tests.
pub fn security(node_id: &str, secret: &str) -> Arc<SecurityContext> {
    Arc::new(SecurityContext::new(node_id, secret, 1_000).expect("security context"))
}

/// Builtin tasks plus `counted`, which records how often it ran.
pub fn counting_tasks(runs: Arc<AtomicUsize>) -> Arc<TaskRegistry> {
    let mut tasks = TaskRegistry::with_builtin_tasks();
    tasks.register::<_, fn(&[Value], &Map<String, Value>) -> f64>(
        "counted",
        move |args: &[Value], _: &Map<String, Value>| -> Result<Value, TaskError> {
            let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "runs": n, "echo": args }))
        },
        None,
    );
    Arc::new(tasks)
}

pub struct TestExecutor {
    pub api: ApiHandle,
    pub runs: Arc<AtomicUsize>,
    pub security: Option<Arc<SecurityContext>>,
}

impl TestExecutor {
    pub fn addr(&self) -> SocketAddr {
        self.api.local_addr()
    }

    pub fn peer(&self, node_id: &str) -> Peer {
        Peer::new(node_id, self.addr().ip(), self.addr().port(), 0.0)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr(), path)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

pub async fn start_executor(host: &str, security: Option<Arc<SecurityContext>>, cpu: f64) -> TestExecutor {
    start_executor_with(host, security, cpu, ProjectIdentity::default(), false).await
}

pub async fn start_executor_with(
    host: &str,
    security: Option<Arc<SecurityContext>>,
    cpu: f64,
    identity: ProjectIdentity,
    allow_plaintext: bool,
) -> TestExecutor {
    let runs = Arc::new(AtomicUsize::new(0));
    let tasks = counting_tasks(runs.clone());
    let identity = ProjectIdentity {
        features: tasks.names(),
        ..identity
    };
    let state = Arc::new(ExecutorState {
        tasks,
        monitor: monitor(cpu),
        security: security.clone(),
        identity,
        host: host.to_string(),
        allow_plaintext,
    });
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("loopback address");
    let api = start_api_server(state, addr).await.expect("executor starts");
    TestExecutor { api, runs, security }
}
