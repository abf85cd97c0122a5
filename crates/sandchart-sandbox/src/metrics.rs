//! Prometheus metrics for sandbox runs.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Label set for run metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    /// Stage name for fragments, `module` or `setup` otherwise.
    pub stage: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Stage name for fragments, `module` or `setup` otherwise.
    pub stage: String,
    /// The error kind, as reported by `SandboxError::kind`.
    pub error_kind: String,
}

/// Prometheus metrics for the sandbox.
pub struct SandboxMetrics {
    /// Total number of successful runs.
    pub runs_total: Family<RunLabels, Counter>,
    /// Run duration in seconds.
    pub run_duration_seconds: Family<RunLabels, Histogram>,
    /// Total number of failed runs by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Execution contexts currently alive.
    pub live_contexts: Gauge<i64, AtomicI64>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let runs_total = Family::default();
        registry.register("sandchart_runs_total", "Total sandbox runs", runs_total.clone());

        let run_duration_seconds = Family::<RunLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0].into_iter())
        });
        registry.register(
            "sandchart_run_duration_seconds",
            "Sandbox run duration",
            run_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "sandchart_errors_total",
            "Total sandbox run failures by stage and kind",
            errors_total.clone(),
        );

        let live_contexts = Gauge::default();
        registry.register(
            "sandchart_live_contexts",
            "Execution contexts currently alive",
            live_contexts.clone(),
        );

        Self {
            runs_total,
            run_duration_seconds,
            errors_total,
            live_contexts,
        }
    }

    /// Record a successful run.
    pub fn record_run(&self, stage: &str, duration_secs: f64) {
        let labels = RunLabels {
            stage: stage.to_string(),
        };
        self.runs_total.get_or_create(&labels).inc();
        self.run_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed run.
    pub fn record_error(&self, stage: &str, error_kind: &str) {
        let labels = ErrorLabels {
            stage: stage.to_string(),
            error_kind: error_kind.to_string(),
        };
        self.errors_total.get_or_create(&labels).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn run_counter_increments_per_stage() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_run("Params", 0.01);
        metrics.record_run("Params", 0.02);
        metrics.record_run("JavaScript", 0.5);

        let labels = RunLabels {
            stage: "Params".into(),
        };
        assert_eq!(metrics.runs_total.get_or_create(&labels).get(), 2);
    }

    #[test]
    fn error_counter_tracks_kind() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_error("JavaScript", "timeout");
        metrics.record_error("JavaScript", "timeout");
        metrics.record_error("module", "js_error");

        let labels = ErrorLabels {
            stage: "JavaScript".into(),
            error_kind: "timeout".into(),
        };
        assert_eq!(metrics.errors_total.get_or_create(&labels).get(), 2);
    }

    #[test]
    fn live_context_gauge() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.live_contexts.inc();
        metrics.live_contexts.inc();
        metrics.live_contexts.dec();
        assert_eq!(metrics.live_contexts.get(), 1);
    }

    #[test]
    fn metrics_encode_to_text() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_run("UI", 1.0);
        metrics.record_error("UI", "timeout");

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();

        assert!(buf.contains("sandchart_runs_total"), "got: {buf}");
        assert!(buf.contains("sandchart_errors_total"), "got: {buf}");
        assert!(buf.contains("stage=\"UI\""), "got: {buf}");
    }
}
