//! Deadline-enforcing probe runner.

use crate::checkers::{CheckError, HealthChecker};
use crate::types::{CheckResult, ProbeOutcome};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::trace;

/// Extra slack on top of a probe's own timeout before the runner gives up.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

/// Runs checkers under a hard deadline and stamps their outcomes.
#[derive(Debug, Clone, Default)]
pub struct CheckRunner {
    grace: Duration,
}

impl CheckRunner {
    pub fn new() -> Self {
        Self {
            grace: DEADLINE_GRACE,
        }
    }

    /// Runner with a custom grace period added to every deadline.
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    /// Run one probe. Never takes longer than `limit` plus the grace period;
    /// a probe that overruns becomes a failed result. Only configuration
    /// problems surface as `Err`.
    pub async fn run(
        &self,
        device_id: &str,
        checker: &dyn HealthChecker,
        limit: Duration,
    ) -> Result<CheckResult, CheckError> {
        let started_at = Utc::now();
        let kind = checker.kind();

        let outcome = match timeout(limit + self.grace, checker.check()).await {
            Ok(result) => result?,
            Err(_) => ProbeOutcome::timeout(limit),
        };

        trace!(device = device_id, kind = %kind, success = outcome.success, "Probe finished");
        Ok(CheckResult::from_outcome(device_id, kind, started_at, outcome))
    }

    /// Run several probes of one device concurrently. Results keep the order
    /// of `checkers`; a fatal error in one probe does not hide the others.
    pub async fn run_all(
        &self,
        device_id: &str,
        checkers: &[(Arc<dyn HealthChecker>, Duration)],
    ) -> Vec<Result<CheckResult, CheckError>> {
        join_all(
            checkers
                .iter()
                .map(|(checker, limit)| self.run(device_id, checker.as_ref(), *limit)),
        )
        .await
    }
}
