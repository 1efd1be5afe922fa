use crate::Error;
use prometheus::{histogram_opts, opts, HistogramTimer, HistogramVec, IntCounterVec, Registry};

/// Prometheus metrics shared by all six controllers, partitioned by a
/// `controller` label so one registry serves the whole manager.
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "gastown_controller_reconcile_duration_seconds",
                "The distribution of reconcile durations"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "gastown_controller_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["controller", "instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!("gastown_controller_reconciliations_total", "reconciliations"),
            &["controller"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, controller: &str, instance: &str, e: &Error) {
        self.failures
            .with_label_values(&[controller, instance, e.metric_label().as_str()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> HistogramTimer {
        self.reconciliations.with_label_values(&[controller]).inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .start_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        let timer = metrics.count_and_measure("polecat");
        drop(timer);
        metrics.reconcile_failure("polecat", "furiosa", &Error::GitError("boom".into()));
        let families = registry.gather();
        assert_eq!(families.len(), 3);
    }
}
