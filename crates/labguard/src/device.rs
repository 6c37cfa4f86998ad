//! Immutable device definitions produced by the configuration provider.

use crate::types::DeviceId;
use healthcheck::{
    CheckError, CheckKind, CommandChecker, CredentialResolver, DnsChecker, HealthChecker,
    HttpChecker, PerformanceChecker, PingChecker, RemoteProbe, RemoteTransport, SessionTarget,
    TcpChecker,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Time reserved in an attempt for operating system detection.
pub const OS_DETECTION_BUDGET: Duration = Duration::from_secs(12);

/// Operating system of a device, selecting its healing playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOs {
    Linux,
    Windows,
}

impl fmt::Display for DeviceOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOs::Linux => write!(f, "linux"),
            DeviceOs::Windows => write!(f, "windows"),
        }
    }
}

/// What counts as a successful healing command sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPolicy {
    /// Session established and every command returned an exit status.
    #[default]
    Executed,
    /// Session established and every command exited 0.
    ZeroExit,
}

/// Whether a successful attempt needs a fresh probe before `Healthy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    #[default]
    Probe,
    Trust,
}

/// Recovery configuration of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct HealingPlan {
    pub enabled: bool,
    pub commands: Vec<String>,
    pub max_attempts: u32,
    pub wait_between_attempts: Duration,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Upper bound for a whole attempt, whatever the command count.
    pub attempt_ceiling: Duration,
    pub command_policy: CommandPolicy,
    pub confirmation: Confirmation,
    /// Candidate playbooks when `commands` is empty; the one run is picked
    /// by detecting the device's operating system over the session.
    pub playbooks: BTreeMap<DeviceOs, Vec<String>>,
}

impl HealingPlan {
    /// Plan that never heals.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            commands: Vec::new(),
            max_attempts: 3,
            wait_between_attempts: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            attempt_ceiling: Duration::from_secs(300),
            command_policy: CommandPolicy::default(),
            confirmation: Confirmation::default(),
            playbooks: BTreeMap::new(),
        }
    }

    /// The command sequence is chosen at attempt time.
    pub fn detects_os(&self) -> bool {
        self.commands.is_empty() && !self.playbooks.is_empty()
    }

    /// Overall attempt deadline, connect included: connect timeout plus the
    /// per-command sum, or the ceiling, whichever is shorter.
    pub fn attempt_deadline(&self) -> Duration {
        let (budget, commands) = if self.detects_os() {
            let longest = self.playbooks.values().map(Vec::len).max().unwrap_or(0);
            (OS_DETECTION_BUDGET, longest)
        } else {
            (Duration::ZERO, self.commands.len())
        };
        let sum = self.connect_timeout + budget + self.command_timeout * commands as u32;
        sum.min(self.attempt_ceiling)
    }
}

/// One configured probe.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckSpec {
    Ping {
        timeout: Duration,
    },
    Tcp {
        port: u16,
        timeout: Duration,
    },
    Http {
        url: String,
        expected_status: u16,
        verify_tls: bool,
        timeout: Duration,
    },
    Dns {
        query: String,
        /// Resolve through the device itself.
        via_device: bool,
        timeout: Duration,
    },
    Command {
        command: String,
        timeout: Duration,
    },
    Performance {
        timeout: Duration,
    },
}

impl CheckSpec {
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckSpec::Ping { .. } => CheckKind::Ping,
            CheckSpec::Tcp { port, .. } => CheckKind::Tcp { port: *port },
            CheckSpec::Http { .. } => CheckKind::Http,
            CheckSpec::Dns { .. } => CheckKind::Dns,
            CheckSpec::Command { .. } => CheckKind::Command,
            CheckSpec::Performance { .. } => CheckKind::Performance,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            CheckSpec::Ping { timeout }
            | CheckSpec::Tcp { timeout, .. }
            | CheckSpec::Http { timeout, .. }
            | CheckSpec::Dns { timeout, .. }
            | CheckSpec::Command { timeout, .. }
            | CheckSpec::Performance { timeout } => *timeout,
        }
    }
}

/// A monitored device. Immutable after load and shared as `Arc<Device>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub lab_id: String,
    pub label: String,
    pub address: String,
    pub interval: Duration,
    pub failure_threshold: u32,
    pub latency_window: usize,
    pub credentials_ref: Option<String>,
    pub ssh_port: u16,
    /// Enabled checks; never empty.
    pub checks: Vec<CheckSpec>,
    /// Index into `checks` of the check that drives the state machine.
    pub primary: usize,
    pub healing: HealingPlan,
    /// Why healing can never run for this device, if it cannot.
    pub unhealable: Option<String>,
}

impl Device {
    pub fn primary_kind(&self) -> CheckKind {
        self.checks
            .get(self.primary)
            .map(CheckSpec::kind)
            .unwrap_or(CheckKind::Ping)
    }

    /// Healing may be dispatched for this device at all.
    pub fn can_heal(&self) -> bool {
        self.healing.enabled && self.unhealable.is_none()
    }

    pub fn session_target(&self) -> SessionTarget {
        SessionTarget::new(self.address.clone(), self.ssh_port)
    }

    /// Build one checker per configured check, in configuration order.
    pub fn build_checkers(
        &self,
        transport: &Arc<dyn RemoteTransport>,
        resolver: &Arc<dyn CredentialResolver>,
    ) -> Result<Vec<(Arc<dyn HealthChecker>, Duration)>, CheckError> {
        self.checks
            .iter()
            .map(|spec| {
                let checker = self.build_checker(spec, transport, resolver)?;
                Ok((checker, spec.timeout()))
            })
            .collect()
    }

    fn build_checker(
        &self,
        spec: &CheckSpec,
        transport: &Arc<dyn RemoteTransport>,
        resolver: &Arc<dyn CredentialResolver>,
    ) -> Result<Arc<dyn HealthChecker>, CheckError> {
        let remote = || -> Result<RemoteProbe, CheckError> {
            let credentials_ref = self.credentials_ref.clone().ok_or_else(|| {
                CheckError::Config(format!("{} check needs SSH credentials", spec.kind()))
            })?;
            Ok(RemoteProbe {
                target: self.session_target(),
                credentials_ref,
                transport: transport.clone(),
                resolver: resolver.clone(),
                timeout_duration: spec.timeout(),
            })
        };

        let checker: Arc<dyn HealthChecker> = match spec {
            CheckSpec::Ping { timeout } => Arc::new(PingChecker::new(&self.address, *timeout)),
            CheckSpec::Tcp { port, timeout } => {
                let target = self.socket_addr(*port)?;
                Arc::new(TcpChecker::new(target, *timeout))
            }
            CheckSpec::Http {
                url,
                expected_status,
                verify_tls,
                timeout,
            } => Arc::new(HttpChecker::new(
                url.clone(),
                *expected_status,
                *verify_tls,
                *timeout,
            )?),
            CheckSpec::Dns {
                query,
                via_device,
                timeout,
            } => {
                let server = if *via_device {
                    Some(self.ip_addr()?)
                } else {
                    None
                };
                Arc::new(DnsChecker::new(query.clone(), server, *timeout))
            }
            CheckSpec::Command { command, .. } => {
                Arc::new(CommandChecker::new(remote()?, command.clone()))
            }
            CheckSpec::Performance { .. } => Arc::new(PerformanceChecker::new(remote()?)),
        };
        Ok(checker)
    }

    fn ip_addr(&self) -> Result<IpAddr, CheckError> {
        self.address.parse().map_err(|_| {
            CheckError::Config(format!("'{}' is not an IP address", self.address))
        })
    }

    fn socket_addr(&self, port: u16) -> Result<SocketAddr, CheckError> {
        Ok(SocketAddr::new(self.ip_addr()?, port))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A ping-only device with healing enabled.
    pub fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            lab_id: "lab1".to_string(),
            label: id.to_string(),
            address: "192.0.2.10".to_string(),
            interval: Duration::from_secs(30),
            failure_threshold: 3,
            latency_window: 10,
            credentials_ref: Some("lab-admin".to_string()),
            ssh_port: 22,
            checks: vec![CheckSpec::Ping {
                timeout: Duration::from_secs(2),
            }],
            primary: 0,
            healing: HealingPlan {
                enabled: true,
                commands: vec!["systemctl restart networking".to_string()],
                ..HealingPlan::disabled()
            },
            unhealable: None,
        }
    }
}
