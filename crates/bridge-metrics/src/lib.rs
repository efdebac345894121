//! Byte-counter reporting used by the data pumps.
//!
//! The pump only needs `counter(name, labels) -> add(delta)`. Three backends:
//! a no-op, a tracing-backed logger, and a Prometheus registry suitable for
//! text exposition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use prometheus::{CounterVec, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus registration failed: {0}")]
    Register(#[from] prometheus::Error),
}

/// Monotonically increasing counter.
pub trait Counter: Send + Sync {
    fn add(&self, delta: u64);
}

/// Creates counters bound to a metric name and a fixed label set.
pub trait MetricsFactory: Send + Sync {
    fn counter(&self, metric: &str, labels: &[(&str, &str)]) -> Arc<dyn Counter>;
}

// ---------------------------------------------------------------------------

/// Discards everything. The default when no reporting is wired.
pub struct NoopMetrics;

struct NoopCounter;

impl Counter for NoopCounter {
    fn add(&self, _delta: u64) {}
}

impl MetricsFactory for NoopMetrics {
    fn counter(&self, _metric: &str, _labels: &[(&str, &str)]) -> Arc<dyn Counter> {
        Arc::new(NoopCounter)
    }
}

// ---------------------------------------------------------------------------

/// Emits every increment as a debug log line.
pub struct LogMetrics;

struct LogCounter {
    metric: String,
    labels: String,
}

impl Counter for LogCounter {
    fn add(&self, delta: u64) {
        tracing::debug!(metric = %self.metric, labels = %self.labels, delta, "metric");
    }
}

impl MetricsFactory for LogMetrics {
    fn counter(&self, metric: &str, labels: &[(&str, &str)]) -> Arc<dyn Counter> {
        let labels = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        Arc::new(LogCounter {
            metric: metric.to_string(),
            labels,
        })
    }
}

// ---------------------------------------------------------------------------

/// Prometheus-backed factory. One `CounterVec` per metric name, registered on
/// a registry the caller exposes over HTTP.
pub struct PromMetrics {
    registry: Registry,
    vecs: Mutex<HashMap<String, CounterVec>>,
}

impl PromMetrics {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            vecs: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn vec_for(&self, metric: &str, label_names: &[&str]) -> Result<CounterVec, MetricsError> {
        let mut vecs = self.vecs.lock().unwrap();
        if let Some(vec) = vecs.get(metric) {
            return Ok(vec.clone());
        }

        let opts = Opts::new(metric.to_string(), format!("bridgemux {metric} bytes"))
            .namespace("bridgemux");
        let vec = CounterVec::new(opts, label_names)?;

        if let Err(err) = self.registry.register(Box::new(vec.clone())) {
            tracing::warn!(metric, err = %err, "could not register counter vec");
        }

        vecs.insert(metric.to_string(), vec.clone());
        Ok(vec)
    }
}

impl Default for PromMetrics {
    fn default() -> Self {
        Self::new()
    }
}

struct PromCounter {
    counter: prometheus::Counter,
}

impl Counter for PromCounter {
    fn add(&self, delta: u64) {
        self.counter.inc_by(delta as f64);
    }
}

impl MetricsFactory for PromMetrics {
    fn counter(&self, metric: &str, labels: &[(&str, &str)]) -> Arc<dyn Counter> {
        let names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();

        match self.vec_for(metric, &names) {
            Ok(vec) => Arc::new(PromCounter {
                counter: vec.with_label_values(&values),
            }),
            Err(err) => {
                tracing::warn!(metric, err = %err, "invalid counter, reporting to nowhere");
                Arc::new(NoopCounter)
            }
        }
    }
}
