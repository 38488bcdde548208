use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters and gauges for task dispatch and execution.
pub struct MeshMetrics {
    pub local_executions: IntCounter,
    pub offloaded_tasks: IntCounter,
    pub dispatch_failures: IntCounterVec,
    pub remote_executions_served: IntCounter,
    pub rejected_messages: IntCounterVec,
    pub usable_peers: IntGauge,
}

impl MeshMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let local_executions = IntCounter::new("dts_local_executions_total", "Tasks executed on this node for local callers")?;
        let offloaded_tasks = IntCounter::new("dts_offloaded_tasks_total", "Tasks executed by a peer")?;
        let dispatch_failures = IntCounterVec::new(
            Opts::new("dts_dispatch_failures_total", "Failed dispatch attempts by reason"),
            &["reason"],
        )?;
        let remote_executions_served = IntCounter::new(
            "dts_remote_executions_served_total",
            "Tasks executed on behalf of peers",
        )?;
        let rejected_messages = IntCounterVec::new(
            Opts::new("dts_rejected_messages_total", "Incoming tasks rejected by reason"),
            &["reason"],
        )?;
        let usable_peers = IntGauge::new("dts_usable_peers", "Peers that are fresh and compatible")?;

        registry.register(Box::new(local_executions.clone()))?;
        registry.register(Box::new(offloaded_tasks.clone()))?;
        registry.register(Box::new(dispatch_failures.clone()))?;
        registry.register(Box::new(remote_executions_served.clone()))?;
        registry.register(Box::new(rejected_messages.clone()))?;
        registry.register(Box::new(usable_peers.clone()))?;

        Ok(Self {
            local_executions,
            offloaded_tasks,
            dispatch_failures,
            remote_executions_served,
            rejected_messages,
            usable_peers,
        })
    }
}

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref METRICS: MeshMetrics =
        MeshMetrics::new(&REGISTRY).expect("mesh metrics register once into a fresh registry");
}

/// Prometheus text exposition of [`REGISTRY`].
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separate_registry() {
        let registry = Registry::new();
        let metrics = MeshMetrics::new(&registry).unwrap();
        metrics.offloaded_tasks.inc();
        metrics.dispatch_failures.with_label_values(&["timeout"]).inc();
        assert_eq!(metrics.offloaded_tasks.get(), 1);

        // Registering the same names twice is refused.
        assert!(MeshMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_gather_text_contains_counters() {
        METRICS.local_executions.inc();
        let text = gather_text();
        assert!(text.contains("dts_local_executions_total"));
    }
}
