//! Prometheus metrics for labguard.

use crate::status_store::PhaseCounts;
use crate::types::Phase;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for per-device metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeviceLabels {
    pub device: String,
}

/// Labels for check result metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CheckLabels {
    pub device: String,
    /// Check kind (ping, tcp, http, dns, command, performance)
    pub kind: String,
    /// Result (success, failure)
    pub result: String,
}

/// Labels for check latency metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LatencyLabels {
    pub device: String,
    pub kind: String,
}

/// Labels for phase transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub device: String,
    pub from: String,
    pub to: String,
}

/// Labels for healing attempt metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealingLabels {
    pub device: String,
    /// Result (success, failure)
    pub result: String,
}

/// Labels for phase-based metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error type (audit_append, audit_prune, checker)
    pub error_type: String,
}

/// Metrics registry with all labguard metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    // Per-device metrics
    checks_total: Family<CheckLabels, Counter>,
    check_latency_seconds: Family<LatencyLabels, Histogram>,
    /// Current phase code (0=healthy .. 4=manual_intervention)
    phase: Family<DeviceLabels, Gauge>,
    consecutive_failures: Family<DeviceLabels, Gauge>,
    phase_transitions_total: Family<TransitionLabels, Counter>,
    healing_attempts_total: Family<HealingLabels, Counter>,
    healing_duration_seconds: Histogram,

    // System-wide metrics
    devices: Gauge,
    devices_rejected: Gauge,
    devices_by_phase: Family<PhaseLabels, Gauge>,
    /// Probe rounds deferred because the probe pool was saturated
    checks_deferred_total: Counter,
    /// Ticks skipped because the previous round was still running
    ticks_skipped_total: Counter,
    errors_total: Family<ErrorLabels, Counter>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // Counters get their `_total` suffix from the encoder.
        let checks_total = Family::<CheckLabels, Counter>::default();
        registry.register(
            "labguard_checks",
            "Total health checks performed",
            checks_total.clone(),
        );

        let check_latency_seconds = Family::<LatencyLabels, Histogram>::new_with_constructor(|| {
            // Exponential buckets from 1ms to ~16s
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        registry.register(
            "labguard_check_latency_seconds",
            "Measured check latency in seconds",
            check_latency_seconds.clone(),
        );

        let phase = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "labguard_phase",
            "Current device phase (0=healthy, 1=degraded, 2=failing, 3=healing, 4=manual_intervention)",
            phase.clone(),
        );

        let consecutive_failures = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "labguard_consecutive_failures",
            "Current consecutive primary check failures",
            consecutive_failures.clone(),
        );

        let phase_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "labguard_phase_transitions",
            "Total device phase transitions",
            phase_transitions_total.clone(),
        );

        let healing_attempts_total = Family::<HealingLabels, Counter>::default();
        registry.register(
            "labguard_healing_attempts",
            "Total healing attempts",
            healing_attempts_total.clone(),
        );

        let healing_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 12));
        registry.register(
            "labguard_healing_duration_seconds",
            "Healing attempt duration in seconds",
            healing_duration_seconds.clone(),
        );

        let devices = Gauge::default();
        registry.register("labguard_devices", "Number of monitored devices", devices.clone());

        let devices_rejected = Gauge::default();
        registry.register(
            "labguard_devices_rejected",
            "Device entries rejected at load",
            devices_rejected.clone(),
        );

        let devices_by_phase = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "labguard_devices_by_phase",
            "Devices by phase",
            devices_by_phase.clone(),
        );

        let checks_deferred_total = Counter::default();
        registry.register(
            "labguard_checks_deferred",
            "Probe rounds deferred because the probe pool was saturated",
            checks_deferred_total.clone(),
        );

        let ticks_skipped_total = Counter::default();
        registry.register(
            "labguard_ticks_skipped",
            "Ticks skipped while the previous probe round was still running",
            ticks_skipped_total.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register("labguard_errors", "Total errors by type", errors_total.clone());

        Self {
            registry,
            checks_total,
            check_latency_seconds,
            phase,
            consecutive_failures,
            phase_transitions_total,
            healing_attempts_total,
            healing_duration_seconds,
            devices,
            devices_rejected,
            devices_by_phase,
            checks_deferred_total,
            ticks_skipped_total,
            errors_total,
        }
    }

    /// Record a check result
    pub fn record_check(&self, device: &str, kind: &str, success: bool, latency: Option<Duration>) {
        self.checks_total
            .get_or_create(&CheckLabels {
                device: device.to_string(),
                kind: kind.to_string(),
                result: result_label(success).to_string(),
            })
            .inc();

        if let Some(latency) = latency {
            self.check_latency_seconds
                .get_or_create(&LatencyLabels {
                    device: device.to_string(),
                    kind: kind.to_string(),
                })
                .observe(latency.as_secs_f64());
        }
    }

    /// Update per-device phase and failure gauges
    pub fn update_device(&self, device: &str, phase: Phase, consecutive_failures: u32) {
        let labels = DeviceLabels {
            device: device.to_string(),
        };
        self.phase.get_or_create(&labels).set(phase.code());
        self.consecutive_failures
            .get_or_create(&labels)
            .set(i64::from(consecutive_failures));
    }

    pub fn record_transition(&self, device: &str, from: Phase, to: Phase) {
        self.phase_transitions_total
            .get_or_create(&TransitionLabels {
                device: device.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
            .inc();
    }

    pub fn record_healing(&self, device: &str, success: bool, duration: Duration) {
        self.healing_attempts_total
            .get_or_create(&HealingLabels {
                device: device.to_string(),
                result: result_label(success).to_string(),
            })
            .inc();
        self.healing_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn set_device_count(&self, loaded: usize, rejected: usize) {
        self.devices.set(loaded as i64);
        self.devices_rejected.set(rejected as i64);
    }

    /// Update devices by phase count
    pub fn update_phase_counts(&self, counts: &PhaseCounts) {
        for (phase, count) in &counts.by_phase {
            self.devices_by_phase
                .get_or_create(&PhaseLabels {
                    phase: phase.to_string(),
                })
                .set(*count as i64);
        }
    }

    pub fn record_deferred(&self) {
        self.checks_deferred_total.inc();
    }

    pub fn record_tick_skipped(&self) {
        self.ticks_skipped_total.inc();
    }

    /// Record error by type
    pub fn record_error(&self, error_type: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn result_label(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}
