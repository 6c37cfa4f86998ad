//! Per-device state, healing records and audit events.

use crate::device::DeviceOs;
use chrono::{DateTime, Utc};
use healthcheck::{CheckKind, CheckResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Stable device identifier, `<lab>/<device>`.
pub type DeviceId = String;

/// Health phase of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Healthy,
    Degraded,
    Failing,
    Healing,
    ManualIntervention,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Healthy,
        Phase::Degraded,
        Phase::Failing,
        Phase::Healing,
        Phase::ManualIntervention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Healthy => "healthy",
            Phase::Degraded => "degraded",
            Phase::Failing => "failing",
            Phase::Healing => "healing",
            Phase::ManualIntervention => "manual_intervention",
        }
    }

    /// Numeric code exported on the phase gauge.
    pub fn code(&self) -> i64 {
        match self {
            Phase::Healthy => 0,
            Phase::Degraded => 1,
            Phase::Failing => 2,
            Phase::Healing => 3,
            Phase::ManualIntervention => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed result of one check kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

impl From<&CheckResult> for CheckSummary {
    fn from(result: &CheckResult) -> Self {
        Self {
            at: result.timestamp,
            success: result.success,
            latency_ms: result.latency_ms(),
            error: result.error.clone(),
        }
    }
}

/// Outcome of the most recent healing attempt, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingSummary {
    pub attempt: u32,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Min/max/mean of a set of latency samples, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub count: usize,
}

impl LatencyStats {
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &sample in samples {
            count += 1;
            sum += sample;
            min = min.min(sample);
            max = max.max(sample);
        }
        (count > 0).then(|| Self {
            min_ms: min,
            max_ms: max,
            mean_ms: sum / count as f64,
            count,
        })
    }
}

/// Rolling health and healing state of one device.
///
/// Owned and mutated only by the device's state machine; the status store
/// holds published copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub lab_id: String,
    pub label: String,
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Healing attempts since the last recovery or manual reset.
    pub healing_attempts: u32,
    pub healing_in_flight: bool,
    /// A healing attempt reported success and a fresh probe must confirm it.
    pub awaiting_confirmation: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_healed_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_healing: Option<HealingSummary>,
    /// Set when the device is monitored but can never be healed.
    pub unhealable: Option<String>,
    /// Latest result per check kind, keyed by kind label (`ping`, `tcp:22`).
    pub last_checks: BTreeMap<String, CheckSummary>,
    latency_window: usize,
    latency_samples: VecDeque<f64>,
}

impl DeviceState {
    pub fn new(
        device_id: impl Into<DeviceId>,
        lab_id: impl Into<String>,
        label: impl Into<String>,
        latency_window: usize,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            lab_id: lab_id.into(),
            label: label.into(),
            phase: Phase::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            healing_attempts: 0,
            healing_in_flight: false,
            awaiting_confirmation: false,
            cooldown_until: None,
            last_healed_at: None,
            last_check_at: None,
            last_error: None,
            last_healing: None,
            unhealable: None,
            last_checks: BTreeMap::new(),
            latency_window: latency_window.max(1),
            latency_samples: VecDeque::new(),
        }
    }

    /// Record a latency sample, evicting the oldest beyond the window.
    pub fn push_latency(&mut self, latency_ms: f64) {
        if self.latency_samples.len() == self.latency_window {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    pub fn latency_samples(&self) -> impl Iterator<Item = &f64> {
        self.latency_samples.iter()
    }

    /// Statistics over the rolling latency window.
    pub fn latency_stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_samples(self.latency_samples.iter())
    }
}

/// Result of one healing command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    /// `None` when the command never produced an exit status.
    pub exit_status: Option<i32>,
    pub error: Option<String>,
    pub output_excerpt: String,
}

impl CommandOutcome {
    pub fn executed(&self) -> bool {
        self.exit_status.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn not_executed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_status: None,
            error: Some(reason.into()),
            output_excerpt: String::new(),
        }
    }
}

/// One complete healing attempt. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    pub device_id: DeviceId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub session_established: bool,
    pub session_error: Option<String>,
    /// Operating system detected over the session, when the playbook was
    /// picked that way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_os: Option<DeviceOs>,
    pub timed_out: bool,
    pub commands: Vec<CommandOutcome>,
    pub success: bool,
}

impl HealingAttempt {
    /// Human-readable reason for a failed attempt.
    pub fn failure_detail(&self) -> Option<String> {
        if self.success {
            return None;
        }
        if let Some(err) = &self.session_error {
            return Some(err.clone());
        }
        if self.timed_out {
            return Some("attempt deadline reached".to_string());
        }
        self.commands
            .iter()
            .find(|c| c.error.is_some() || !c.succeeded())
            .map(|c| match &c.error {
                Some(err) => format!("`{}`: {}", c.command, err),
                None => format!(
                    "`{}` exited with {}",
                    c.command,
                    c.exit_status.unwrap_or_default()
                ),
            })
    }
}

/// Durable history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    CheckRecorded {
        result: CheckResult,
        /// Whether this result drove the state machine.
        primary: bool,
    },
    StateTransitioned {
        device_id: DeviceId,
        from: Phase,
        to: Phase,
        reason: String,
    },
    HealingStarted {
        device_id: DeviceId,
        attempt: u32,
    },
    HealingAttemptFinished {
        attempt: HealingAttempt,
    },
    ManualInterventionRequired {
        device_id: DeviceId,
        attempts: u32,
        reason: String,
    },
}

impl AuditEvent {
    pub fn device_id(&self) -> &str {
        match self {
            AuditEvent::CheckRecorded { result, .. } => &result.device_id,
            AuditEvent::StateTransitioned { device_id, .. }
            | AuditEvent::HealingStarted { device_id, .. }
            | AuditEvent::ManualInterventionRequired { device_id, .. } => device_id,
            AuditEvent::HealingAttemptFinished { attempt } => &attempt.device_id,
        }
    }

    /// Activity-feed events: everything except raw check records.
    pub fn is_activity(&self) -> bool {
        !matches!(self, AuditEvent::CheckRecorded { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::CheckRecorded { .. } => "check_recorded",
            AuditEvent::StateTransitioned { .. } => "state_transitioned",
            AuditEvent::HealingStarted { .. } => "healing_started",
            AuditEvent::HealingAttemptFinished { .. } => "healing_attempt_finished",
            AuditEvent::ManualInterventionRequired { .. } => "manual_intervention_required",
        }
    }

    /// The primary check result carried by this event, if any.
    pub fn primary_check(&self) -> Option<&CheckResult> {
        match self {
            AuditEvent::CheckRecorded {
                result,
                primary: true,
            } => Some(result),
            _ => None,
        }
    }
}

/// An [`AuditEvent`] as written to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Kind label used as the key of [`DeviceState::last_checks`].
pub fn check_key(kind: &CheckKind) -> String {
    kind.to_string()
}
