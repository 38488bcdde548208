use dts_config::PolicyConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use sysinfo::{CpuExt, System, SystemExt};
use thiserror::Error;
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Load sampling unavailable: {0}")]
    Unavailable(String),
}

/// One reading of local resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// CPU usage as a fraction (0.0 - 1.0)
    pub cpu: f64,
    pub mem_available_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub cpu: f64,
    pub mem_available_mb: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Offload,
    Local,
}

/// Source of load readings.
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> Result<LoadSample, MonitorError>;

    /// CPU usage in percent (0 - 100) as served on `/cpu`.
    fn instant_cpu_percent(&self) -> Result<f64, MonitorError> {
        self.sample().map(|s| s.cpu * 100.0)
    }
}

/// Production sampler backed by `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the system handle
/// is kept alive and primed once at construction.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemSampler {
    fn sample(&self) -> Result<LoadSample, MonitorError> {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        if system.total_memory() == 0 {
            return Err(MonitorError::Unavailable("memory statistics not reported".to_string()));
        }
        let usage = system.global_cpu_info().cpu_usage();
        if !usage.is_finite() {
            return Err(MonitorError::Unavailable("CPU usage not reported".to_string()));
        }

        Ok(LoadSample {
            cpu: (f64::from(usage) / 100.0).clamp(0.0, 1.0),
            mem_available_mb: system.available_memory() as f64 / BYTES_PER_MB,
        })
    }
}

/// Rolling view of local load and the offload decision built on it.
pub struct ResourceMonitor {
    sampler: Arc<dyn LoadSampler>,
    policy: PolicyConfig,
    window: Mutex<VecDeque<LoadSample>>,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn LoadSampler>, policy: PolicyConfig) -> Self {
        let capacity = policy.window.max(1);
        Self {
            sampler,
            policy,
            window: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Take a reading and push it into the window.
    pub fn sample(&self) -> Result<LoadSample, MonitorError> {
        let sample = self.sampler.sample()?;
        let capacity = self.policy.window.max(1);
        let mut window = self.window.lock();
        while window.len() >= capacity {
            window.pop_front();
        }
        window.push_back(sample);
        Ok(sample)
    }

    pub fn rolling_average(&self) -> Option<LoadAverage> {
        let window = self.window.lock();
        if window.is_empty() {
            return None;
        }
        let n = window.len() as f64;
        let (cpu, mem) = window
            .iter()
            .fold((0.0, 0.0), |(c, m), s| (c + s.cpu, m + s.mem_available_mb));
        Some(LoadAverage {
            cpu: cpu / n,
            mem_available_mb: mem / n,
            samples: window.len(),
        })
    }

    /// Whether a task of the given complexity should leave this node.
    ///
    /// A failed reading votes to stay local.
    pub fn should_offload(&self, complexity: f64) -> bool {
        if let Err(e) = self.sample() {
            warn!(error = %e, "Load sampling failed, keeping task local");
            return false;
        }
        let Some(average) = self.rolling_average() else {
            return false;
        };

        let cpu_vote = average.cpu > self.policy.cpu_threshold;
        let complexity_vote = complexity > self.policy.complexity_ceiling;
        let memory_vote = self
            .policy
            .memory_floor_mb
            .map(|floor| average.mem_available_mb < floor)
            .unwrap_or(false);

        debug!(
            avg_cpu = average.cpu,
            avg_mem_mb = average.mem_available_mb,
            complexity,
            cpu_vote,
            complexity_vote,
            memory_vote,
            "Offload decision"
        );
        cpu_vote || complexity_vote || memory_vote
    }

    /// Load-only recommendation, for diagnostics.
    pub fn recommendation(&self) -> Recommendation {
        if self.should_offload(0.0) {
            Recommendation::Offload
        } else {
            Recommendation::Local
        }
    }

    /// Latest CPU fraction, sampling when the window is empty. Used for the
    /// advertised load.
    pub fn current_load(&self) -> f64 {
        match self.sample() {
            Ok(sample) => sample.cpu,
            Err(_) => self.rolling_average().map(|a| a.cpu).unwrap_or(0.0),
        }
    }

    pub fn instant_cpu_percent(&self) -> Result<f64, MonitorError> {
        self.sampler.instant_cpu_percent()
    }
}
