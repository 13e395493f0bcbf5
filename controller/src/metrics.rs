use models::refresh::{DrainOutcome, RefreshPhase};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use snafu::ResultExt;

const MOVED: &str = "moved";
const FAILED: &str = "failed";

/// Prometheus counters published by the refresh controller.
#[derive(Clone)]
pub struct RefreshControllerMetrics {
    cycles_completed: IntCounter,
    pods_total: IntCounterVec,
    phase_transitions: IntCounterVec,
    reconcile_failures: IntCounter,
}

impl RefreshControllerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, error::MetricsError> {
        let cycles_completed = IntCounter::new(
            "noderefresh_cycles_completed",
            "Refresh cycles driven to completion",
        )
        .context(error::CreateMetricSnafu)?;
        let pods_total = IntCounterVec::new(
            Opts::new("noderefresh_pods_total", "Pods acted on during drains"),
            &["result"],
        )
        .context(error::CreateMetricSnafu)?;
        let phase_transitions = IntCounterVec::new(
            Opts::new(
                "noderefresh_phase_transitions",
                "State machine transitions by entered phase",
            ),
            &["phase"],
        )
        .context(error::CreateMetricSnafu)?;
        let reconcile_failures = IntCounter::new(
            "noderefresh_reconcile_failures",
            "Reconcile invocations that ended in an error",
        )
        .context(error::CreateMetricSnafu)?;

        registry
            .register(Box::new(cycles_completed.clone()))
            .context(error::RegisterMetricSnafu)?;
        registry
            .register(Box::new(pods_total.clone()))
            .context(error::RegisterMetricSnafu)?;
        registry
            .register(Box::new(phase_transitions.clone()))
            .context(error::RegisterMetricSnafu)?;
        registry
            .register(Box::new(reconcile_failures.clone()))
            .context(error::RegisterMetricSnafu)?;

        Ok(RefreshControllerMetrics {
            cycles_completed,
            pods_total,
            phase_transitions,
            reconcile_failures,
        })
    }

    pub fn observe_transition(&self, phase: RefreshPhase) {
        self.phase_transitions
            .with_label_values(&[&phase.to_string()])
            .inc();
    }

    pub fn observe_evictions(&self, outcome: &DrainOutcome) {
        self.pods_total
            .with_label_values(&[MOVED])
            .inc_by(outcome.pods_moved);
        self.pods_total
            .with_label_values(&[FAILED])
            .inc_by(outcome.pods_failed);
    }

    pub fn observe_cycle_completed(&self) {
        self.cycles_completed.inc();
    }

    pub fn observe_reconcile_failure(&self) {
        self.reconcile_failures.inc();
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum MetricsError {
        #[snafu(display("Failed to create metric: '{}'", source))]
        CreateMetric { source: prometheus::Error },

        #[snafu(display("Failed to register metric: '{}'", source))]
        RegisterMetric { source: prometheus::Error },
    }
}
