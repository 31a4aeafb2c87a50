//! Observability infrastructure for the node agent
//!
//! Provides:
//! - Prometheus metrics (admission, task outcomes, status pushes, sampling latency)
//! - Structured JSON logging with tracing

use crate::models::Limits;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for sampling cycle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<CaptainMetricsInner> = OnceLock::new();

struct CaptainMetricsInner {
    running_tasks: IntGauge,
    tasks_admitted: IntCounter,
    admissions_clamped: IntCounter,
    admissions_rejected: IntCounter,
    task_failures: IntCounter,
    status_pushes: IntCounter,
    status_push_failures: IntCounter,
    sampling_latency_seconds: Histogram,
    sampling_errors: IntCounter,
    unassigned_cpu_shares: IntGauge,
    unassigned_memory_bytes: IntGauge,
}

impl CaptainMetricsInner {
    fn new() -> Self {
        Self {
            running_tasks: register_int_gauge!(
                "captain_running_tasks",
                "Number of tasks whose container is currently tracked"
            )
            .expect("Failed to register running_tasks"),

            tasks_admitted: register_int_counter!(
                "captain_tasks_admitted_total",
                "Total number of tasks admitted against node capacity"
            )
            .expect("Failed to register tasks_admitted"),

            admissions_clamped: register_int_counter!(
                "captain_admissions_clamped_total",
                "Total number of admissions whose request was clamped to remaining capacity"
            )
            .expect("Failed to register admissions_clamped"),

            admissions_rejected: register_int_counter!(
                "captain_admissions_rejected_total",
                "Total number of tasks rejected for insufficient capacity"
            )
            .expect("Failed to register admissions_rejected"),

            task_failures: register_int_counter!(
                "captain_task_failures_total",
                "Total number of tasks that failed to create or run"
            )
            .expect("Failed to register task_failures"),

            status_pushes: register_int_counter!(
                "captain_status_pushes_total",
                "Total number of node status messages sent to the spinner"
            )
            .expect("Failed to register status_pushes"),

            status_push_failures: register_int_counter!(
                "captain_status_push_failures_total",
                "Total number of failed node status pushes"
            )
            .expect("Failed to register status_push_failures"),

            sampling_latency_seconds: register_histogram!(
                "captain_sampling_latency_seconds",
                "Time spent measuring live utilization of all tracked containers",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sampling_latency_seconds"),

            sampling_errors: register_int_counter!(
                "captain_sampling_errors_total",
                "Total number of aborted sampling cycles"
            )
            .expect("Failed to register sampling_errors"),

            unassigned_cpu_shares: register_int_gauge!(
                "captain_unassigned_cpu_shares",
                "CPU shares not reserved by any task"
            )
            .expect("Failed to register unassigned_cpu_shares"),

            unassigned_memory_bytes: register_int_gauge!(
                "captain_unassigned_memory_bytes",
                "Memory bytes not reserved by any task"
            )
            .expect("Failed to register unassigned_memory_bytes"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct CaptainMetrics {
    _private: (),
}

impl Default for CaptainMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptainMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CaptainMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CaptainMetricsInner {
        GLOBAL_METRICS.get_or_init(CaptainMetricsInner::new)
    }

    pub fn set_running_tasks(&self, count: i64) {
        self.inner().running_tasks.set(count);
    }

    /// Record an admission; `clamped` when the grant is smaller than the request
    pub fn inc_admitted(&self, clamped: bool) {
        self.inner().tasks_admitted.inc();
        if clamped {
            self.inner().admissions_clamped.inc();
        }
    }

    pub fn inc_rejected(&self) {
        self.inner().admissions_rejected.inc();
    }

    pub fn inc_task_failures(&self) {
        self.inner().task_failures.inc();
    }

    pub fn inc_status_pushes(&self) {
        self.inner().status_pushes.inc();
    }

    pub fn inc_status_push_failures(&self) {
        self.inner().status_push_failures.inc();
    }

    pub fn observe_sampling_latency(&self, duration_secs: f64) {
        self.inner().sampling_latency_seconds.observe(duration_secs);
    }

    pub fn inc_sampling_errors(&self) {
        self.inner().sampling_errors.inc();
    }

    pub fn set_unassigned(&self, unassigned: &Limits) {
        self.inner().unassigned_cpu_shares.set(unassigned.cpu_shares);
        self.inner()
            .unassigned_memory_bytes
            .set(unassigned.memory_bytes);
    }
}

/// Structured logger for agent events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_id: String,
}

impl StructuredLogger {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn log_task_admitted(&self, task_id: &str, app_id: &str, requested: &Limits, granted: &Limits) {
        info!(
            event = "task_admitted",
            node = %self.node_id,
            task_id = %task_id,
            app_id = %app_id,
            requested = %requested,
            granted = %granted,
            clamped = requested != granted,
            "Task admitted"
        );
    }

    pub fn log_task_finished(&self, task_id: &str, outcome: &str, reason: Option<&str>) {
        match reason {
            Some(reason) => warn!(
                event = "task_finished",
                node = %self.node_id,
                task_id = %task_id,
                outcome = %outcome,
                reason = %reason,
                "Task finished"
            ),
            None => info!(
                event = "task_finished",
                node = %self.node_id,
                task_id = %task_id,
                outcome = %outcome,
                "Task finished"
            ),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, role: &str, capacity: &Limits) {
        info!(
            event = "agent_started",
            node = %self.node_id,
            agent_version = %version,
            role = %role,
            capacity = %capacity,
            "Captain started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_id,
            reason = %reason,
            "Captain shutting down"
        );
    }

    pub fn log_status_push_failed(&self, error: &str, fatal: bool) {
        warn!(
            event = "status_push_failed",
            node = %self.node_id,
            error = %error,
            fatal = fatal,
            "Failed to push node status to spinner"
        );
    }
}
