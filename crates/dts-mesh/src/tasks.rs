//! Named task functions that may run locally or on behalf of a peer.

use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Complexity of functions with no estimator of their own.
pub const DEFAULT_COMPLEXITY: f64 = 1.0;

/// Upper bounds on built-in task arguments. Tasks arrive from the network,
/// so each one must stay within memory and time a node can afford.
pub const MAX_MATRIX_SIZE: u64 = 1_000;
pub const MAX_PRIME_LIMIT: u64 = 5_000_000;
pub const MAX_DATA_SIZE: u64 = 100_000_000;
pub const MAX_IMAGE_ITERATIONS: u64 = 1_000_000;
pub const MAX_COMPLEX_X: u64 = 1_000_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Function not found: {0}")]
    NotFound(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Task failed: {0}")]
    Failed(String),
}

pub type TaskHandler = Arc<dyn Fn(&[Value], &Map<String, Value>) -> Result<Value, TaskError> + Send + Sync>;
pub type ComplexityEstimator = Arc<dyn Fn(&[Value], &Map<String, Value>) -> f64 + Send + Sync>;

#[derive(Clone)]
struct RegisteredTask {
    handler: TaskHandler,
    estimator: Option<ComplexityEstimator>,
}

/// Name to function table, shared by the dispatcher and the executor.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the canonical built-in tasks.
    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::new();
        registry.register(
            "matrix_multiply",
            matrix_multiply,
            Some(|args: &[Value], kwargs: &Map<String, Value>| {
                let size = number_arg(args, kwargs, 0, "size").unwrap_or(0.0);
                size * size
            }),
        );
        registry.register(
            "prime_calculation",
            prime_calculation,
            Some(|args: &[Value], kwargs: &Map<String, Value>| number_arg(args, kwargs, 0, "n").unwrap_or(0.0) / 100.0),
        );
        registry.register(
            "data_processing",
            data_processing,
            Some(|args: &[Value], kwargs: &Map<String, Value>| number_arg(args, kwargs, 0, "size").unwrap_or(0.0) / 10.0),
        );
        registry.register(
            "image_processing_emulation",
            image_processing_emulation,
            Some(|args: &[Value], kwargs: &Map<String, Value>| {
                number_arg(args, kwargs, 0, "iterations").unwrap_or(0.0) * 5.0
            }),
        );
        registry.register::<_, fn(&[Value], &Map<String, Value>) -> f64>("complex_operation", complex_operation, None);
        registry
    }

    /// Add or replace a task.
    pub fn register<H, E>(&mut self, name: impl Into<String>, handler: H, estimator: Option<E>)
    where
        H: Fn(&[Value], &Map<String, Value>) -> Result<Value, TaskError> + Send + Sync + 'static,
        E: Fn(&[Value], &Map<String, Value>) -> f64 + Send + Sync + 'static,
    {
        self.tasks.insert(
            name.into(),
            RegisteredTask {
                handler: Arc::new(handler),
                estimator: estimator.map(|e| Arc::new(e) as ComplexityEstimator),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.tasks.get(name).map(|t| t.handler.clone())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Complexity estimate; unknown functions and functions without an
    /// estimator weigh [`DEFAULT_COMPLEXITY`].
    pub fn estimate(&self, name: &str, args: &[Value], kwargs: &Map<String, Value>) -> f64 {
        self.tasks
            .get(name)
            .and_then(|t| t.estimator.as_ref())
            .map(|estimate| estimate(args, kwargs))
            .filter(|c| c.is_finite())
            .unwrap_or(DEFAULT_COMPLEXITY)
    }

    pub fn execute(&self, name: &str, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, TaskError> {
        let handler = self
            .get(name)
            .ok_or_else(|| TaskError::NotFound(name.to_string()))?;
        handler(args, kwargs)
    }

    /// Run a task on the blocking pool. Panics become [`TaskError::Failed`].
    pub async fn execute_blocking(
        self: &Arc<Self>,
        name: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, TaskError> {
        if !self.contains(&name) {
            return Err(TaskError::NotFound(name));
        }
        let registry = Arc::clone(self);
        match tokio::task::spawn_blocking(move || registry.execute(&name, &args, &kwargs)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskError::Failed(panic_message(e.into_panic()))),
            Err(e) => Err(TaskError::Failed(e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

/// Positional argument `index`, else keyword `name`.
fn arg<'a>(args: &'a [Value], kwargs: &'a Map<String, Value>, index: usize, name: &str) -> Option<&'a Value> {
    args.get(index).or_else(|| kwargs.get(name))
}

fn number_arg(args: &[Value], kwargs: &Map<String, Value>, index: usize, name: &str) -> Option<f64> {
    arg(args, kwargs, index, name).and_then(Value::as_f64)
}

fn count_arg(args: &[Value], kwargs: &Map<String, Value>, index: usize, name: &str) -> Result<u64, TaskError> {
    let value = arg(args, kwargs, index, name)
        .ok_or_else(|| TaskError::InvalidArguments(format!("missing argument '{}'", name)))?;
    value
        .as_u64()
        .ok_or_else(|| TaskError::InvalidArguments(format!("'{}' must be a non-negative integer, got {}", name, value)))
}

fn bounded_count_arg(
    args: &[Value],
    kwargs: &Map<String, Value>,
    index: usize,
    name: &str,
    max: u64,
) -> Result<u64, TaskError> {
    let value = count_arg(args, kwargs, index, name)?;
    if value > max {
        return Err(TaskError::InvalidArguments(format!("'{}' exceeds the limit of {}: {}", name, max, value)));
    }
    Ok(value)
}

fn matrix_multiply(args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, TaskError> {
    let size = bounded_count_arg(args, kwargs, 0, "size", MAX_MATRIX_SIZE)? as usize;
    let mut rng = rand::thread_rng();
    let mut random = || -> Vec<Vec<f64>> {
        (0..size)
            .map(|_| (0..size).map(|_| rng.gen::<f64>()).collect())
            .collect()
    };
    let a = random();
    let b = random();

    let result: Vec<Vec<f64>> = (0..size)
        .map(|i| {
            (0..size)
                .map(|j| (0..size).map(|k| a[i][k] * b[k][j]).sum())
                .collect()
        })
        .collect();
    Ok(json!({ "result": result }))
}

fn prime_calculation(args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, TaskError> {
    let n = bounded_count_arg(args, kwargs, 0, "n", MAX_PRIME_LIMIT)?;
    let primes: Vec<u64> = (2..=n)
        .filter(|&candidate| (2..).take_while(|d| d * d <= candidate).all(|d| candidate % d != 0))
        .collect();
    Ok(json!({ "count": primes.len(), "primes": primes }))
}

fn data_processing(args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, TaskError> {
    let size = bounded_count_arg(args, kwargs, 0, "size", MAX_DATA_SIZE)?;
    let checksum: f64 = (0..size)
        .map(|i| {
            let x = i as f64 * 0.001;
            x.sin() * x.cos()
        })
        .sum();
    Ok(json!({ "processed_items": size, "checksum": checksum }))
}

fn image_processing_emulation(args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, TaskError> {
    let iterations = bounded_count_arg(args, kwargs, 0, "iterations", MAX_IMAGE_ITERATIONS)?;
    let results: Vec<f64> = (0..iterations)
        .map(|block| {
            let start = block * 100;
            (start..start + 100).map(|p| (p as f64).sqrt()).sum()
        })
        .collect();
    Ok(json!({ "iterations": iterations, "results": results }))
}

fn complex_operation(args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, TaskError> {
    let x = bounded_count_arg(args, kwargs, 0, "x", MAX_COMPLEX_X)?;
    let limit = x * 1000;
    let total = (0..limit)
        .try_fold(0u128, |acc, i| acc.checked_add(u128::from(i) * u128::from(i)))
        .ok_or_else(|| TaskError::Failed("sum overflowed".to_string()))?;
    // JSON numbers top out at u64; larger sums are reported as floats.
    Ok(match u64::try_from(total) {
        Ok(v) => json!(v),
        Err(_) => json!(total as f64),
    })
}
