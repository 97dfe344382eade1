//! Prometheus metrics for the reconcilers

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::{CoreError, Result};

/// Metrics shared by the NAD controller and the load balancer reconciler
#[derive(Clone)]
pub struct ReconcilerMetrics {
    /// NAD syncs by result ("success", "conflict", "error")
    pub nad_syncs_total: CounterVec,
    /// NAD sync duration in seconds
    pub nad_sync_duration_seconds: HistogramVec,
    /// EnsureLBs calls by result
    pub ensure_lbs_total: CounterVec,
    /// EnsureLBs duration in seconds
    pub ensure_lbs_duration_seconds: HistogramVec,
    /// Store operations built, by kind
    pub store_operations_total: CounterVec,
    pub registry: Arc<Registry>,
}

impl ReconcilerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let nad_syncs_total = CounterVec::new(
            Opts::new("netplane_nad_syncs_total", "Total NAD syncs by result"),
            &["controller", "result"],
        )?;

        let nad_sync_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "netplane_nad_sync_duration_seconds",
                "NAD sync latency in seconds",
            ),
            &["controller"],
        )?;

        let ensure_lbs_total = CounterVec::new(
            Opts::new("netplane_ensure_lbs_total", "Total EnsureLBs calls by result"),
            &["result"],
        )?;

        let ensure_lbs_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "netplane_ensure_lbs_duration_seconds",
                "EnsureLBs latency in seconds",
            ),
            &["result"],
        )?;

        let store_operations_total = CounterVec::new(
            Opts::new(
                "netplane_store_operations_total",
                "Northbound store operations built, by kind",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(nad_syncs_total.clone()))?;
        registry.register(Box::new(nad_sync_duration_seconds.clone()))?;
        registry.register(Box::new(ensure_lbs_total.clone()))?;
        registry.register(Box::new(ensure_lbs_duration_seconds.clone()))?;
        registry.register(Box::new(store_operations_total.clone()))?;

        Ok(Self {
            nad_syncs_total,
            nad_sync_duration_seconds,
            ensure_lbs_total,
            ensure_lbs_duration_seconds,
            store_operations_total,
            registry,
        })
    }

    pub fn observe_nad_sync(&self, controller: &str, result: &str, seconds: f64) {
        self.nad_syncs_total
            .with_label_values(&[controller, result])
            .inc();
        self.nad_sync_duration_seconds
            .with_label_values(&[controller])
            .observe(seconds);
    }

    pub fn observe_ensure_lbs(&self, result: &str, seconds: f64) {
        self.ensure_lbs_total.with_label_values(&[result]).inc();
        self.ensure_lbs_duration_seconds
            .with_label_values(&[result])
            .observe(seconds);
    }

    pub fn count_operation(&self, kind: &str) {
        self.store_operations_total.with_label_values(&[kind]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

/// Label for the outcome of a sync
pub fn result_label(result: &Result<()>) -> &'static str {
    match result {
        Ok(()) => "success",
        Err(e) if e.is_conflict() => "conflict",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather() {
        let metrics = ReconcilerMetrics::new().unwrap();
        metrics.observe_nad_sync("[cluster-manager NAD controller]", "success", 0.01);
        metrics.observe_ensure_lbs("error", 0.2);
        metrics.count_operation("insert");

        let text = metrics.gather().unwrap();
        assert!(text.contains("netplane_nad_syncs_total"));
        assert!(text.contains("netplane_ensure_lbs_duration_seconds"));
        assert!(text.contains("kind=\"insert\""));
    }

    #[test]
    fn test_result_label() {
        assert_eq!(result_label(&Ok(())), "success");
        let conflict = Err(CoreError::PrimaryConflict {
            controller: "c".to_string(),
            existing: "ns1/a".to_string(),
            key: "ns1/b".to_string(),
        });
        assert_eq!(result_label(&conflict), "conflict");
        assert_eq!(
            result_label(&Err(CoreError::Internal("x".to_string()))),
            "error"
        );
    }
}
