//! HTTP executor: `/run`, `/health`, `/cpu`, `/project_info` and `/metrics`.

use dts_identity::{SecurityContext, SecurityError};
use dts_mesh::metrics::{gather_text, METRICS};
use dts_mesh::{ResourceMonitor, TaskError, TaskRegistry};
use dts_types::protocol::{
    CONTENT_TYPE_JSON, CPU_PATH, HEALTH_PATH, METRICS_PATH, PROJECT_INFO_PATH, RUN_PATH, SIGNATURE_HEADER,
};
use dts_types::{CpuResponse, ErrorBody, HealthResponse, ProjectIdentity, RunResponse, Task};
use hyper::{
    body::HttpBody,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Largest `/run` body accepted, sealed or plain.
pub const MAX_RUN_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Everything the executor needs to serve requests.
pub struct ExecutorState {
    pub tasks: Arc<TaskRegistry>,
    pub monitor: Arc<ResourceMonitor>,
    pub security: Option<Arc<SecurityContext>>,
    pub identity: ProjectIdentity,
    /// Host name reported in run responses
    pub host: String,
    /// Accept unsigned JSON tasks even when a security context is configured
    pub allow_plaintext: bool,
}

/// Running API server.
pub struct ApiHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ApiHandle {
    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::error!("API server task failed: {}", e);
        }
    }
}

/// Bind the executor on `addr` and serve it in the background.
pub async fn start_api_server(state: Arc<ExecutorState>, addr: SocketAddr) -> anyhow::Result<ApiHandle> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async { Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| handle_request(req, state.clone()))) }
    });

    let builder = Server::try_bind(&addr).map_err(|e| anyhow::anyhow!("Failed to bind API server on {}: {}", addr, e))?;
    let server = builder.serve(make_svc);
    let local_addr = server.local_addr();
    tracing::info!("Executor listening on http://{}", local_addr);

    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let graceful = server.with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    let handle = tokio::spawn(async move {
        if let Err(e) = graceful.await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(ApiHandle {
        local_addr,
        shutdown,
        handle,
    })
}

async fn handle_request(req: Request<Body>, state: Arc<ExecutorState>) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, RUN_PATH) => handle_run(req, state).await,

        (&Method::GET, HEALTH_PATH) => Ok(json_response(StatusCode::OK, &HealthResponse::ok())),

        (&Method::GET, CPU_PATH) => match state.monitor.instant_cpu_percent() {
            Ok(usage) => Ok(json_response(StatusCode::OK, &CpuResponse { usage })),
            Err(e) => Ok(server_error(&e.to_string())),
        },

        (&Method::GET, PROJECT_INFO_PATH) => Ok(json_response(StatusCode::OK, &state.identity)),

        (&Method::GET, METRICS_PATH) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(gather_text()))
            .unwrap_or_else(|_| Response::new(Body::from("Internal Server Error")))),

        _ => Ok(not_found()),
    }
}

async fn handle_run(req: Request<Body>, state: Arc<ExecutorState>) -> Result<Response<Body>, hyper::Error> {
    let is_json = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(is_json_media_type)
        .unwrap_or(false);
    let declared_length = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared_length.map_or(false, |len| len > MAX_RUN_BODY_BYTES as u64) {
        return Ok(payload_too_large());
    }
    let signature_header = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = match read_body(req.into_body(), MAX_RUN_BODY_BYTES).await? {
        Some(body) => body,
        None => return Ok(payload_too_large()),
    };

    let task = if is_json {
        match accept_plain(&state, &body) {
            Ok(task) => task,
            Err(response) => return Ok(response),
        }
    } else {
        match accept_sealed(&state, &body, signature_header.as_deref()) {
            Ok(task) => task,
            Err(response) => return Ok(response),
        }
    };

    if !state.tasks.contains(&task.func) {
        tracing::warn!(func = %task.func, sender = %task.sender_id, "Function not found");
        METRICS.rejected_messages.with_label_values(&["not_found"]).inc();
        return Ok(error_response(StatusCode::NOT_FOUND, "Function not found"));
    }

    tracing::info!(func = %task.func, task_id = %task.task_id, sender = %task.sender_id, "Executing task for peer");
    let started = Instant::now();
    match state.tasks.execute_blocking(task.func, task.args, task.kwargs).await {
        Ok(result) => {
            METRICS.remote_executions_served.inc();
            let response = RunResponse {
                result,
                host: state.host.clone(),
                elapsed: started.elapsed().as_secs_f64(),
            };
            Ok(json_response(StatusCode::OK, &response))
        }
        Err(TaskError::NotFound(_)) => Ok(error_response(StatusCode::NOT_FOUND, "Function not found")),
        Err(e) => {
            tracing::warn!(error = %e, "Task execution failed");
            Ok(server_error(&e.to_string()))
        }
    }
}

/// `application/json`, ignoring case and parameters such as `charset`.
fn is_json_media_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .map(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
        .unwrap_or(false)
}

/// Collect a body of at most `limit` bytes. `None` once the limit is passed.
async fn read_body(mut body: Body, limit: usize) -> Result<Option<Vec<u8>>, hyper::Error> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if collected.len() + chunk.len() > limit {
            return Ok(None);
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Some(collected))
}

/// Development-mode JSON body. Signed bodies are verified when a security
/// context exists; unsigned ones are refused unless plaintext is allowed.
fn accept_plain(state: &ExecutorState, body: &[u8]) -> Result<Task, Response<Body>> {
    let mut task: Task = serde_json::from_slice(body).map_err(|_| {
        METRICS.rejected_messages.with_label_values(&["malformed"]).inc();
        bad_request("Malformed JSON")
    })?;

    match &state.security {
        Some(security) if task.is_signed() => {
            if !security.verify(&task) {
                METRICS.rejected_messages.with_label_values(&["signature"]).inc();
                return Err(error_response(StatusCode::FORBIDDEN, "Invalid signature"));
            }
        }
        Some(_) if !state.allow_plaintext => {
            METRICS.rejected_messages.with_label_values(&["unsigned"]).inc();
            return Err(error_response(StatusCode::FORBIDDEN, "Unsigned tasks are not accepted"));
        }
        _ => {}
    }
    task.strip_signature();
    Ok(task)
}

fn accept_sealed(state: &ExecutorState, body: &[u8], signature_hex: Option<&str>) -> Result<Task, Response<Body>> {
    let Some(security) = &state.security else {
        METRICS.rejected_messages.with_label_values(&["no_secret"]).inc();
        return Err(bad_request("Encrypted payload received but no shared secret is configured"));
    };

    security.open_task(body, signature_hex).map_err(|e| {
        tracing::warn!(error = %e, "Rejected sealed task");
        match e {
            SecurityError::Decryption => {
                METRICS.rejected_messages.with_label_values(&["decryption"]).inc();
                error_response(StatusCode::BAD_REQUEST, "Decryption failed")
            }
            SecurityError::InvalidSignature => {
                METRICS.rejected_messages.with_label_values(&["signature"]).inc();
                error_response(StatusCode::FORBIDDEN, "Invalid signature")
            }
            other => {
                METRICS.rejected_messages.with_label_values(&["malformed"]).inc();
                bad_request(&other.to_string())
            }
        }
    })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::from("Internal Server Error"))),
        Err(e) => server_error(&e.to_string()),
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response<Body> {
    let body = serde_json::to_vec(&ErrorBody::new(msg)).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("Internal Server Error")))
}

// Helper for 400 Bad Request responses
fn bad_request(msg: &str) -> Response<Body> {
    error_response(StatusCode::BAD_REQUEST, msg)
}

// Helper for 404 Not Found responses
fn not_found() -> Response<Body> {
    error_response(StatusCode::NOT_FOUND, "Not Found")
}

fn payload_too_large() -> Response<Body> {
    METRICS.rejected_messages.with_label_values(&["too_large"]).inc();
    error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
}

fn server_error(msg: &str) -> Response<Body> {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, msg)
}
