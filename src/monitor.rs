//! Step timing and error notes for one analysis run.
//!
//! Phases and individual inference calls are recorded under a step name
//! (`"fetch"`, `"filter"`, `"inference.filter"`, ...). The summary aggregates
//! every step into count / total / min / max / mean and is embedded in the run
//! result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

impl StepStats {
    fn record(&mut self, d: Duration) {
        let ms = d.as_secs_f64() * 1000.0;
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        self.mean_ms = self.total_ms / self.count as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNote {
    pub step: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_ms: f64,
    pub steps: BTreeMap<String, StepStats>,
    pub errors: Vec<ErrorNote>,
}

#[derive(Default)]
struct Inner {
    steps: BTreeMap<String, StepStats>,
    errors: Vec<ErrorNote>,
}

/// Thread-safe collector of step timings.
pub struct PerformanceMonitor {
    started: Instant,
    inner: Mutex<Inner>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record(&self, step: &str, duration: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.steps.entry(step.to_string()).or_default().record(duration);
        }
        debug!(step, elapsed_ms = duration.as_millis() as u64, "Step recorded");
    }

    pub fn record_error(&self, step: &str, error: impl Display) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.errors.push(ErrorNote {
                step: step.to_string(),
                error: error.to_string(),
                at: Utc::now(),
            });
        }
    }

    /// Await `fut` and record how long it took under `step`.
    pub async fn time<F, T>(&self, step: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let t0 = Instant::now();
        let out = fut.await;
        self.record(step, t0.elapsed());
        out
    }

    pub fn step(&self, step: &str) -> Option<StepStats> {
        self.inner.lock().ok()?.steps.get(step).copied()
    }

    pub fn summary(&self) -> PerformanceSummary {
        let (steps, errors) = match self.inner.lock() {
            Ok(inner) => (inner.steps.clone(), inner.errors.clone()),
            Err(_) => (BTreeMap::new(), Vec::new()),
        };
        PerformanceSummary {
            total_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            steps,
            errors,
        }
    }
}
