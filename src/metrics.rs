//! Lifecycle metrics
//!
//! A Prometheus registry owned by the resource manager. `ridctl` writes the
//! text exposition to a file for the node exporter's textfile collector.

use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metrics recorded by lifecycle operations
pub struct LifecycleMetrics {
    registry: Registry,
    operations: IntCounterVec,
    durations: HistogramVec,
    mounted: IntGauge,
}

impl LifecycleMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "ridctl_operations_total",
                "Lifecycle operations by outcome",
            ),
            &["operation", "outcome"],
        )?;
        let durations = HistogramVec::new(
            HistogramOpts::new(
                "ridctl_operation_duration_seconds",
                "Duration of lifecycle operations",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0, 7200.0]),
            &["operation"],
        )?;
        let mounted = IntGauge::new(
            "ridctl_mounted_resources",
            "Resources with a resource directory on this node",
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(durations.clone()))?;
        registry.register(Box::new(mounted.clone()))?;

        Ok(Self {
            registry,
            operations,
            durations,
            mounted,
        })
    }

    /// Record one finished operation; `outcome` is `ok` or an error kind
    pub fn record(&self, operation: &str, outcome: &str, elapsed: Duration) {
        self.operations
            .with_label_values(&[operation, outcome])
            .inc();
        self.durations
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_mounted(&self, count: usize) {
        self.mounted.set(count as i64);
    }

    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Text exposition of every metric
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_encode() {
        let metrics = LifecycleMetrics::new().unwrap();
        metrics.record("mount", "ok", Duration::from_millis(250));
        metrics.record("mount", "busy", Duration::from_millis(10));
        metrics.record("mount", "ok", Duration::from_millis(300));
        metrics.set_mounted(2);

        assert_eq!(metrics.operation_count("mount", "ok"), 2);
        assert_eq!(metrics.operation_count("umount", "ok"), 0);

        let text = metrics.encode().unwrap();
        assert!(text.contains("ridctl_operations_total{operation=\"mount\",outcome=\"busy\"} 1"));
        assert!(text.contains("ridctl_mounted_resources 2"));
    }
}
