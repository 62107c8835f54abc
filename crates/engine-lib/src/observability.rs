//! Observability for the actuation engine
//!
//! Provides:
//! - Prometheus metrics (decision and predictor latency, fallbacks, suppressions, retries)
//! - Structured JSON logging of decisions and lifecycle events

use crate::models::{ActionSet, ActionType};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0,
];

static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    decision_latency_seconds: Histogram,
    predictor_latency_seconds: Histogram,
    decisions_recorded: IntCounterVec,
    predictor_fallbacks: IntCounterVec,
    cooldown_suppressions: IntCounterVec,
    critical_bypasses: IntCounter,
    record_retries: IntCounter,
    record_failures: IntCounter,
    scheduler_ticks: IntCounter,
    device_failures: IntCounter,
    auto_devices: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            decision_latency_seconds: register_histogram!(
                "actuation_engine_decision_latency_seconds",
                "End-to-end time to produce and record one decision",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register decision_latency_seconds"),

            predictor_latency_seconds: register_histogram!(
                "actuation_engine_predictor_latency_seconds",
                "Time spent waiting on the external predictor",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register predictor_latency_seconds"),

            decisions_recorded: register_int_counter_vec!(
                "actuation_engine_decisions_recorded_total",
                "Decisions persisted, by source",
                &["source"]
            )
            .expect("Failed to register decisions_recorded_total"),

            predictor_fallbacks: register_int_counter_vec!(
                "actuation_engine_predictor_fallbacks_total",
                "Times the rule engine replaced the predictor, by reason",
                &["reason"]
            )
            .expect("Failed to register predictor_fallbacks_total"),

            cooldown_suppressions: register_int_counter_vec!(
                "actuation_engine_cooldown_suppressions_total",
                "Actions zeroed by the cooldown guard, by action type",
                &["action"]
            )
            .expect("Failed to register cooldown_suppressions_total"),

            critical_bypasses: register_int_counter!(
                "actuation_engine_critical_bypass_total",
                "Decisions that skipped the cooldown guard due to critical readings"
            )
            .expect("Failed to register critical_bypass_total"),

            record_retries: register_int_counter!(
                "actuation_engine_record_retries_total",
                "Decision inserts retried after an id conflict"
            )
            .expect("Failed to register record_retries_total"),

            record_failures: register_int_counter!(
                "actuation_engine_record_failures_total",
                "Decisions that could not be persisted"
            )
            .expect("Failed to register record_failures_total"),

            scheduler_ticks: register_int_counter!(
                "actuation_engine_scheduler_ticks_total",
                "Auto-mode scheduler ticks executed"
            )
            .expect("Failed to register scheduler_ticks_total"),

            device_failures: register_int_counter!(
                "actuation_engine_device_failures_total",
                "Per-device failures during scheduler ticks"
            )
            .expect("Failed to register device_failures_total"),

            auto_devices: register_int_gauge!(
                "actuation_engine_auto_devices",
                "Devices with auto mode enabled at the last tick"
            )
            .expect("Failed to register auto_devices"),
        }
    }
}

/// Handle to the process-wide engine metrics
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn observe_decision_latency(&self, duration_secs: f64) {
        self.inner().decision_latency_seconds.observe(duration_secs);
    }

    pub fn observe_predictor_latency(&self, duration_secs: f64) {
        self.inner().predictor_latency_seconds.observe(duration_secs);
    }

    pub fn inc_decisions_recorded(&self, source: &str) {
        self.inner()
            .decisions_recorded
            .with_label_values(&[source])
            .inc();
    }

    pub fn inc_predictor_fallbacks(&self, reason: &str) {
        self.inner()
            .predictor_fallbacks
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_cooldown_suppressions(&self, action: ActionType) {
        self.inner()
            .cooldown_suppressions
            .with_label_values(&[action.as_str()])
            .inc();
    }

    pub fn inc_critical_bypasses(&self) {
        self.inner().critical_bypasses.inc();
    }

    pub fn inc_record_retries(&self) {
        self.inner().record_retries.inc();
    }

    pub fn inc_record_failures(&self) {
        self.inner().record_failures.inc();
    }

    pub fn inc_scheduler_ticks(&self) {
        self.inner().scheduler_ticks.inc();
    }

    pub fn inc_device_failures(&self) {
        self.inner().device_failures.inc();
    }

    pub fn set_auto_devices(&self, count: i64) {
        self.inner().auto_devices.set(count);
    }
}

/// Structured logger for decision events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    service: String,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Log a recorded decision
    pub fn log_decision(
        &self,
        decision_id: i64,
        device_id: &str,
        actions: &ActionSet,
        manual: bool,
        requested_by: Option<&str>,
        latency_ms: u64,
    ) {
        info!(
            event = "decision_recorded",
            service = %self.service,
            decision_id = decision_id,
            device_id = %device_id,
            source = %actions.source(),
            ph_up = actions.ph_up(),
            ph_down = actions.ph_down(),
            nutrient_add = actions.nutrient_add(),
            refill = actions.refill(),
            value_s = actions.value_s(),
            manual = manual,
            requested_by = requested_by.unwrap_or("-"),
            latency_ms = latency_ms,
            "Decision recorded"
        );
    }

    /// Log actions held back by the cooldown guard
    pub fn log_suppressed(&self, device_id: &str, suppressed: &[ActionType]) {
        if suppressed.is_empty() {
            return;
        }
        let actions = suppressed
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(",");
        info!(
            event = "cooldown_suppressed",
            service = %self.service,
            device_id = %device_id,
            actions = %actions,
            "Actions suppressed by cooldown"
        );
    }

    /// Log a cooldown bypass caused by critical readings
    pub fn log_critical_bypass(&self, device_id: &str, conditions: &str) {
        warn!(
            event = "critical_bypass",
            service = %self.service,
            device_id = %device_id,
            conditions = %conditions,
            "Critical readings, cooldown bypassed"
        );
    }

    /// Log a predictor failure answered by the rule engine
    pub fn log_predictor_fallback(&self, device_id: &str, reason: &str, error: &str) {
        warn!(
            event = "predictor_fallback",
            service = %self.service,
            device_id = %device_id,
            reason = %reason,
            error = %error,
            "Predictor unavailable, falling back to rules"
        );
    }

    pub fn log_startup(&self, version: &str, predictor: &str) {
        info!(
            event = "engine_started",
            service = %self.service,
            engine_version = %version,
            predictor = %predictor,
            "Actuation engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            service = %self.service,
            reason = %reason,
            "Actuation engine shutting down"
        );
    }
}
