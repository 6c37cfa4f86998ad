//! Probe types and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of health probe run against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    /// ICMP echo via the system ping utility
    Ping,
    /// TCP connect to a service port
    Tcp { port: u16 },
    /// HTTP/HTTPS request with an expected status
    Http,
    /// DNS resolution
    Dns,
    /// Remote command over SSH, success on exit status 0
    Command,
    /// CPU/memory/disk sampling over SSH
    Performance,
}

impl CheckKind {
    /// Short label used in metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            CheckKind::Ping => "ping",
            CheckKind::Tcp { .. } => "tcp",
            CheckKind::Http => "http",
            CheckKind::Dns => "dns",
            CheckKind::Command => "command",
            CheckKind::Performance => "performance",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Tcp { port } => write!(f, "tcp:{}", port),
            other => f.write_str(other.label()),
        }
    }
}

/// Resource usage sampled from a remote host (percentages).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
}

impl PerformanceSample {
    pub fn is_empty(&self) -> bool {
        self.cpu_usage.is_none() && self.memory_usage.is_none() && self.disk_usage.is_none()
    }
}

/// Raw outcome of one probe, before it is stamped with device and time.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub success: bool,

    /// Measured round trip, when the probe reports one
    pub latency: Option<Duration>,

    pub error: Option<String>,

    /// Response code (for HTTP checks)
    pub response_code: Option<u16>,

    pub metrics: Option<PerformanceSample>,
}

impl ProbeOutcome {
    /// Create a successful outcome
    pub fn healthy(latency: Duration) -> Self {
        Self {
            success: true,
            latency: Some(latency),
            error: None,
            response_code: None,
            metrics: None,
        }
    }

    /// Create a failed outcome
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            success: false,
            latency: None,
            error: Some(message.into()),
            response_code: None,
            metrics: None,
        }
    }

    /// Create a timeout outcome
    pub fn timeout(after: Duration) -> Self {
        Self::unhealthy(format!("timed out after {}ms", after.as_millis()))
    }

    pub fn with_response_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    pub fn with_metrics(mut self, metrics: PerformanceSample) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Result of one probe against one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub device_id: String,
    pub kind: CheckKind,

    /// Time the probe was started. Results are ordered by this, not by
    /// completion.
    pub timestamp: DateTime<Utc>,

    pub success: bool,

    #[serde(default, with = "humantime_serde")]
    pub latency: Option<Duration>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub response_code: Option<u16>,

    #[serde(default)]
    pub metrics: Option<PerformanceSample>,
}

impl CheckResult {
    /// Stamp a probe outcome with device and start time.
    pub fn from_outcome(
        device_id: impl Into<String>,
        kind: CheckKind,
        timestamp: DateTime<Utc>,
        outcome: ProbeOutcome,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            timestamp,
            success: outcome.success,
            latency: outcome.latency,
            error: outcome.error,
            response_code: outcome.response_code,
            metrics: outcome.metrics,
        }
    }

    /// Successful result, mostly useful for scripted sequences.
    pub fn success(
        device_id: impl Into<String>,
        kind: CheckKind,
        timestamp: DateTime<Utc>,
        latency: Duration,
    ) -> Self {
        Self::from_outcome(device_id, kind, timestamp, ProbeOutcome::healthy(latency))
    }

    /// Failed result, mostly useful for scripted sequences.
    pub fn failure(
        device_id: impl Into<String>,
        kind: CheckKind,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self::from_outcome(device_id, kind, timestamp, ProbeOutcome::unhealthy(error))
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.map(|d| d.as_secs_f64() * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_kind_display() {
        assert_eq!(CheckKind::Ping.to_string(), "ping");
        assert_eq!(CheckKind::Tcp { port: 22 }.to_string(), "tcp:22");
        assert_eq!(CheckKind::Tcp { port: 22 }.label(), "tcp");
        assert_eq!(CheckKind::Performance.to_string(), "performance");
    }

    #[test]
    fn test_check_result_serde() {
        let result = CheckResult::success(
            "lab1/pc-01",
            CheckKind::Tcp { port: 443 },
            Utc::now(),
            Duration::from_millis(12),
        );
        let json = serde_json::to_string(&result).unwrap();
        let parsed: CheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
        assert_eq!(parsed.latency_ms(), Some(12.0));
    }

    #[test]
    fn test_timeout_outcome_message() {
        let outcome = ProbeOutcome::timeout(Duration::from_millis(250));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("timed out after 250ms"));
    }
}
