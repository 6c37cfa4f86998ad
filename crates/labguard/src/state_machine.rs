//! Per-device health and healing state machine.
//!
//! ```text
//! Healthy ──fail──▶ Degraded ──threshold──▶ Failing ──start──▶ Healing
//!    ▲                  │                      ▲  │               │
//!    └──────success─────┴──────────────────────┘  │      attempt failed
//!    ▲                                            │               │
//!    └───────confirmed────────── Healing ◀────────┘    max attempts reached
//!                                                                 ▼
//!                                                      ManualIntervention
//! ```
//!
//! The machine is pure: it never performs I/O. Each operation returns
//! [`Effects`] that the owning worker applies (audit append, status publish,
//! healing dispatch).

use crate::device::{Confirmation, Device};
use crate::error::CoreError;
use crate::types::{
    AuditEvent, CheckSummary, DeviceState, HealingAttempt, HealingSummary, Phase, check_key,
};
use chrono::{DateTime, Utc};
use healthcheck::CheckResult;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A phase change caused by one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
}

/// Request to run one healing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealingDispatch {
    pub attempt: u32,
}

/// What the owner must do after an operation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    pub transitions: Vec<Transition>,
    pub dispatch: Option<HealingDispatch>,
    pub events: Vec<AuditEvent>,
    /// The check result was older than the last applied one and ignored.
    pub stale: bool,
}

impl Effects {
    /// Whether the published state may have changed.
    pub fn changes_state(&self) -> bool {
        !self.stale && (!self.events.is_empty() || self.dispatch.is_some())
    }
}

/// Owns and mutates the [`DeviceState`] of one device.
#[derive(Debug)]
pub struct DeviceStateMachine {
    device: Arc<Device>,
    state: DeviceState,
    last_applied: Option<DateTime<Utc>>,
}

impl DeviceStateMachine {
    pub fn new(device: Arc<Device>) -> Self {
        let mut state = DeviceState::new(
            device.id.clone(),
            device.lab_id.clone(),
            device.label.clone(),
            device.latency_window,
        );
        state.unhealable = device.unhealable.clone();
        Self {
            device,
            state,
            last_applied: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Feed one probe result. Only the device's primary check kind drives
    /// transitions; other kinds are recorded.
    pub fn apply_check(&mut self, result: &CheckResult) -> Effects {
        let primary = result.kind == self.device.primary_kind();
        let mut fx = Effects::default();
        fx.events.push(AuditEvent::CheckRecorded {
            result: result.clone(),
            primary,
        });

        if !primary {
            self.record_secondary(result);
            return fx;
        }

        if self
            .last_applied
            .is_some_and(|last| result.timestamp <= last)
        {
            debug!(device = %self.device.id, timestamp = %result.timestamp, "Discarding stale check result");
            fx.stale = true;
            return fx;
        }
        self.last_applied = Some(result.timestamp);
        self.state.last_check_at = Some(result.timestamp);
        self.state
            .last_checks
            .insert(check_key(&result.kind), CheckSummary::from(result));

        if self.predates_healing(result) {
            debug!(device = %self.device.id, timestamp = %result.timestamp, "Check started before healing finished, awaiting a fresh one");
            return fx;
        }
        if result.success {
            self.on_success(result, &mut fx);
        } else {
            self.on_failure(result, &mut fx);
        }
        fx
    }

    /// The dispatched attempt actually started executing.
    pub fn healing_started(&mut self) -> Effects {
        let mut fx = Effects::default();
        if !self.state.healing_in_flight {
            warn!(device = %self.device.id, "Healing start without a dispatch");
            return fx;
        }
        let attempt = self.state.healing_attempts + 1;
        fx.events.push(AuditEvent::HealingStarted {
            device_id: self.device.id.clone(),
            attempt,
        });
        self.transition(
            Phase::Healing,
            format!("healing attempt {} started", attempt),
            &mut fx,
        );
        fx
    }

    /// Apply the outcome of the in-flight healing attempt.
    pub fn apply_healing_outcome(&mut self, attempt: &HealingAttempt) -> Effects {
        let mut fx = Effects::default();
        fx.events.push(AuditEvent::HealingAttemptFinished {
            attempt: attempt.clone(),
        });
        if !self.state.healing_in_flight {
            warn!(device = %self.device.id, attempt = attempt.attempt, "Healing outcome without a dispatch");
            return fx;
        }

        let plan = &self.device.healing;
        self.state.healing_in_flight = false;
        self.state.healing_attempts += 1;
        self.state.last_healed_at = Some(attempt.finished_at);
        self.state.last_healing = Some(HealingSummary {
            attempt: attempt.attempt,
            success: attempt.success,
            finished_at: attempt.finished_at,
            detail: attempt.failure_detail(),
        });

        if attempt.success {
            match plan.confirmation {
                Confirmation::Probe => {
                    self.state.awaiting_confirmation = true;
                    self.transition(
                        Phase::Healing,
                        "healing commands succeeded, awaiting confirmation".to_string(),
                        &mut fx,
                    );
                }
                Confirmation::Trust => {
                    self.state.consecutive_failures = 0;
                    self.state.awaiting_confirmation = false;
                    self.transition(
                        Phase::Healthy,
                        "healing commands succeeded".to_string(),
                        &mut fx,
                    );
                }
            }
            return fx;
        }

        let detail = attempt
            .failure_detail()
            .unwrap_or_else(|| "unknown failure".to_string());
        if self.state.healing_attempts >= plan.max_attempts {
            self.enter_manual_intervention(
                format!(
                    "{} healing attempts failed, last: {}",
                    self.state.healing_attempts, detail
                ),
                &mut fx,
            );
        } else {
            self.state.cooldown_until = Some(attempt.finished_at + plan.wait_between_attempts);
            self.transition(
                Phase::Failing,
                format!("healing attempt {} failed: {}", attempt.attempt, detail),
                &mut fx,
            );
            self.try_dispatch(attempt.finished_at, &mut fx);
        }
        fx
    }

    /// Re-arm after a cooldown elapsed. Dispatches when the device is still
    /// failing and nothing is in flight.
    pub fn rearm(&mut self, now: DateTime<Utc>) -> Effects {
        let mut fx = Effects::default();
        self.try_dispatch(now, &mut fx);
        fx
    }

    /// When the owner should call [`rearm`](Self::rearm), if at all.
    pub fn next_rearm(&self) -> Option<DateTime<Utc>> {
        if self.state.phase != Phase::Failing
            || self.state.healing_in_flight
            || self.state.consecutive_failures == 0
            || !self.device.can_heal()
        {
            return None;
        }
        self.state.cooldown_until
    }

    /// External reset out of `ManualIntervention`.
    pub fn manual_reset(&mut self) -> Result<Effects, CoreError> {
        if self.state.phase != Phase::ManualIntervention {
            return Err(CoreError::ResetNotApplicable {
                device: self.device.id.clone(),
                phase: self.state.phase,
            });
        }
        let mut fx = Effects::default();
        self.state.consecutive_failures = 0;
        self.state.consecutive_successes = 0;
        self.clear_healing();
        self.transition(Phase::Healthy, "manual reset".to_string(), &mut fx);
        Ok(fx)
    }

    /// A result whose probe started before the last healing attempt
    /// finished cannot confirm or refute that attempt.
    fn predates_healing(&self, result: &CheckResult) -> bool {
        let state = &self.state;
        state.phase == Phase::Healing
            && state.awaiting_confirmation
            && !state.healing_in_flight
            && state
                .last_healed_at
                .is_some_and(|healed| result.timestamp < healed)
    }

    fn record_secondary(&mut self, result: &CheckResult) {
        let key = check_key(&result.kind);
        let newer = self
            .state
            .last_checks
            .get(&key)
            .is_none_or(|prev| prev.at < result.timestamp);
        if newer {
            self.state.last_checks.insert(key, CheckSummary::from(result));
        }
    }

    fn on_success(&mut self, result: &CheckResult, fx: &mut Effects) {
        let state = &mut self.state;
        state.consecutive_failures = 0;
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.last_error = None;
        if let Some(ms) = result.latency_ms() {
            state.push_latency(ms);
        }

        let attempts = state.healing_attempts;
        match state.phase {
            Phase::Healthy => {
                if attempts > 0 {
                    debug!(device = %self.device.id, attempts, "Recovery confirmed, clearing healing history");
                    self.clear_healing();
                }
            }
            Phase::Degraded => {
                self.clear_healing();
                self.transition(Phase::Healthy, recovered(attempts), fx);
            }
            Phase::Failing if state.healing_in_flight => {
                debug!(device = %self.device.id, "Check succeeded while healing is pending");
            }
            Phase::Failing => {
                self.clear_healing();
                self.transition(Phase::Healthy, recovered(attempts), fx);
            }
            Phase::Healing if state.healing_in_flight => {}
            Phase::Healing => {
                self.clear_healing();
                self.transition(
                    Phase::Healthy,
                    format!("recovery confirmed after {} healing attempts", attempts),
                    fx,
                );
            }
            Phase::ManualIntervention => {}
        }
    }

    fn on_failure(&mut self, result: &CheckResult, fx: &mut Effects) {
        let threshold = self.device.failure_threshold;
        let state = &mut self.state;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.consecutive_successes = 0;
        state.last_error = Some(
            result
                .error
                .clone()
                .unwrap_or_else(|| "check failed".to_string()),
        );
        let failures = state.consecutive_failures;

        match state.phase {
            Phase::ManualIntervention => {}
            Phase::Healing if state.healing_in_flight => {}
            Phase::Healing => {
                // The attempt reported success but the device is still down.
                state.awaiting_confirmation = false;
                let reason = "healing did not restore the device".to_string();
                if state.healing_attempts >= self.device.healing.max_attempts {
                    self.enter_manual_intervention(reason, fx);
                } else {
                    let healed_at = state.last_healed_at.unwrap_or(result.timestamp);
                    state.cooldown_until =
                        Some(healed_at + self.device.healing.wait_between_attempts);
                    self.transition(Phase::Failing, reason, fx);
                    self.try_dispatch(result.timestamp, fx);
                }
            }
            Phase::Failing => self.try_dispatch(result.timestamp, fx),
            Phase::Healthy | Phase::Degraded if failures >= threshold => {
                self.transition(
                    Phase::Failing,
                    format!("{} consecutive failures", failures),
                    fx,
                );
                self.try_dispatch(result.timestamp, fx);
            }
            Phase::Healthy | Phase::Degraded => {
                self.transition(
                    Phase::Degraded,
                    format!("{} consecutive failures", failures),
                    fx,
                );
            }
        }
    }

    /// Single-flight dispatch guard.
    fn try_dispatch(&mut self, now: DateTime<Utc>, fx: &mut Effects) {
        let state = &self.state;
        if !self.device.can_heal()
            || state.phase != Phase::Failing
            || state.healing_in_flight
            || state.consecutive_failures == 0
        {
            return;
        }
        if state.cooldown_until.is_some_and(|until| now < until) {
            return;
        }
        if state.healing_attempts >= self.device.healing.max_attempts {
            let reason = format!("{} healing attempts exhausted", state.healing_attempts);
            self.enter_manual_intervention(reason, fx);
            return;
        }

        let attempt = state.healing_attempts + 1;
        self.state.cooldown_until = None;
        self.state.healing_in_flight = true;
        fx.dispatch = Some(HealingDispatch { attempt });
        info!(device = %self.device.id, attempt, "Dispatching healing");
    }

    fn enter_manual_intervention(&mut self, reason: String, fx: &mut Effects) {
        self.state.cooldown_until = None;
        self.state.awaiting_confirmation = false;
        error!(
            device = %self.device.id,
            attempts = self.state.healing_attempts,
            reason = %reason,
            "Automatic healing exhausted, manual intervention required"
        );
        self.transition(Phase::ManualIntervention, reason.clone(), fx);
        fx.events.push(AuditEvent::ManualInterventionRequired {
            device_id: self.device.id.clone(),
            attempts: self.state.healing_attempts,
            reason,
        });
    }

    fn clear_healing(&mut self) {
        self.state.healing_attempts = 0;
        self.state.cooldown_until = None;
        self.state.awaiting_confirmation = false;
    }

    fn transition(&mut self, to: Phase, reason: String, fx: &mut Effects) {
        let from = self.state.phase;
        if from == to {
            return;
        }
        self.state.phase = to;
        info!(device = %self.device.id, %from, %to, reason = %reason, "Phase transition");
        fx.transitions.push(Transition { from, to });
        fx.events.push(AuditEvent::StateTransitioned {
            device_id: self.device.id.clone(),
            from,
            to,
            reason,
        });
    }
}

fn recovered(attempts: u32) -> String {
    if attempts > 0 {
        format!("recovered after {} healing attempts", attempts)
    } else {
        "check succeeded".to_string()
    }
}
