//! Health check implementations.

use crate::session::{CredentialResolver, RemoteTransport, SessionTarget};
use crate::types::{CheckKind, PerformanceSample, ProbeOutcome};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{timeout, timeout_at};
use tracing::{debug, warn};

/// Fatal probe errors. Expected failure modes (unreachable, refused, auth)
/// are reported through [`ProbeOutcome`] instead.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("invalid check configuration: {0}")]
    Config(String),
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform a health check
    async fn check(&self) -> Result<ProbeOutcome, CheckError>;

    /// Which kind of probe this is
    fn kind(&self) -> CheckKind;
}

/// ICMP reachability checker using the system `ping` binary.
pub struct PingChecker {
    address: String,
    timeout_duration: Duration,
}

impl PingChecker {
    pub fn new(address: impl Into<String>, timeout_duration: Duration) -> Self {
        Self {
            address: address.into(),
            timeout_duration,
        }
    }
}

#[async_trait]
impl HealthChecker for PingChecker {
    async fn check(&self) -> Result<ProbeOutcome, CheckError> {
        let start = Instant::now();
        let wait_secs = self.timeout_duration.as_secs().max(1);

        let output = Command::new("ping")
            .args(["-n", "-c", "1", "-W"])
            .arg(wait_secs.to_string())
            .arg(&self.address)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match timeout(self.timeout_duration, output).await {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let latency = parse_ping_rtt(&stdout).unwrap_or_else(|| start.elapsed());
                debug!(address = %self.address, latency_ms = latency.as_millis(), "Ping check successful");
                Ok(ProbeOutcome::healthy(latency))
            }
            Ok(Ok(output)) => {
                warn!(address = %self.address, "Ping check failed: no reply");
                Ok(ProbeOutcome::unhealthy(format!(
                    "no echo reply (exit status {})",
                    output.status.code().unwrap_or(-1)
                )))
            }
            Ok(Err(e)) => {
                warn!(address = %self.address, error = %e, "Ping check could not run");
                Ok(ProbeOutcome::unhealthy(format!("ping failed to run: {}", e)))
            }
            Err(_) => {
                warn!(address = %self.address, "Ping check timed out");
                Ok(ProbeOutcome::timeout(self.timeout_duration))
            }
        }
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Ping
    }
}

/// Extract `time=1.23 ms` from ping output.
pub fn parse_ping_rtt(output: &str) -> Option<Duration> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let millis: f64 = rest[..end].parse().ok()?;
    Some(Duration::from_secs_f64(millis / 1000.0))
}

/// TCP health checker
pub struct TcpChecker {
    target: SocketAddr,
    timeout_duration: Duration,
}

impl TcpChecker {
    /// Create a new TCP health checker
    pub fn new(target: SocketAddr, timeout_duration: Duration) -> Self {
        Self {
            target,
            timeout_duration,
        }
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> Result<ProbeOutcome, CheckError> {
        let start = Instant::now();

        match timeout(self.timeout_duration, TcpStream::connect(self.target)).await {
            Ok(Ok(_stream)) => {
                let duration = start.elapsed();
                debug!(target = %self.target, duration_ms = duration.as_millis(), "TCP check successful");
                Ok(ProbeOutcome::healthy(duration))
            }
            Ok(Err(e)) => {
                warn!(target = %self.target, error = %e, "TCP check failed");
                Ok(ProbeOutcome::unhealthy(format!("Connection failed: {}", e)))
            }
            Err(_) => {
                warn!(target = %self.target, "TCP check timed out");
                Ok(ProbeOutcome::timeout(self.timeout_duration))
            }
        }
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Tcp {
            port: self.target.port(),
        }
    }
}

/// HTTP health checker
pub struct HttpChecker {
    url: String,
    expected_status: u16,
    timeout_duration: Duration,
    client: reqwest::Client,
}

impl HttpChecker {
    /// Create a new HTTP health checker. Lab devices commonly serve
    /// self-signed certificates, so certificate validation is optional.
    pub fn new(
        url: String,
        expected_status: u16,
        verify_tls: bool,
        timeout_duration: Duration,
    ) -> Result<Self, CheckError> {
        reqwest::Url::parse(&url)
            .map_err(|e| CheckError::Config(format!("invalid URL '{}': {}", url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(timeout_duration)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| CheckError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            url,
            expected_status,
            timeout_duration,
            client,
        })
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> Result<ProbeOutcome, CheckError> {
        let start = Instant::now();

        match timeout(self.timeout_duration, self.client.get(&self.url).send()).await {
            Ok(Ok(response)) => {
                let duration = start.elapsed();
                let status_code = response.status().as_u16();

                if status_code == self.expected_status {
                    debug!(url = %self.url, status = status_code, duration_ms = duration.as_millis(),
                           "HTTP check successful");
                    Ok(ProbeOutcome::healthy(duration).with_response_code(status_code))
                } else {
                    warn!(url = %self.url, status = status_code, "HTTP check failed: unexpected status code");
                    Ok(ProbeOutcome::unhealthy(format!(
                        "Unexpected status code: {} (expected {})",
                        status_code, self.expected_status
                    ))
                    .with_response_code(status_code))
                }
            }
            Ok(Err(e)) if e.is_timeout() => {
                warn!(url = %self.url, "HTTP check timed out");
                Ok(ProbeOutcome::timeout(self.timeout_duration))
            }
            Ok(Err(e)) => {
                warn!(url = %self.url, error = %e, "HTTP check failed");
                Ok(ProbeOutcome::unhealthy(format!("HTTP request failed: {}", e)))
            }
            Err(_) => {
                warn!(url = %self.url, "HTTP check timed out");
                Ok(ProbeOutcome::timeout(self.timeout_duration))
            }
        }
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Http
    }
}

/// DNS health checker
pub struct DnsChecker {
    query: String,
    /// Resolve through this server instead of the system resolver
    server: Option<IpAddr>,
    timeout_duration: Duration,
}

impl DnsChecker {
    /// Create a new DNS health checker
    pub fn new(query: String, server: Option<IpAddr>, timeout_duration: Duration) -> Self {
        Self {
            query,
            server,
            timeout_duration,
        }
    }

    async fn resolve(&self) -> Result<Vec<IpAddr>, String> {
        match self.server {
            None => tokio::net::lookup_host(format!("{}:0", self.query))
                .await
                .map(|addrs| addrs.map(|addr| addr.ip()).collect())
                .map_err(|e| e.to_string()),
            Some(server) => {
                use trust_dns_resolver::TokioAsyncResolver;
                use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};

                let mut opts = ResolverOpts::default();
                opts.timeout = self.timeout_duration;
                opts.attempts = 1;
                let config = ResolverConfig::from_parts(
                    None,
                    vec![],
                    NameServerConfigGroup::from_ips_clear(&[server], 53, true),
                );
                let resolver = TokioAsyncResolver::tokio(config, opts);
                resolver
                    .lookup_ip(self.query.as_str())
                    .await
                    .map(|lookup| lookup.iter().collect())
                    .map_err(|e| e.to_string())
            }
        }
    }
}

#[async_trait]
impl HealthChecker for DnsChecker {
    async fn check(&self) -> Result<ProbeOutcome, CheckError> {
        let start = Instant::now();

        match timeout(self.timeout_duration, self.resolve()).await {
            Ok(Ok(ips)) if !ips.is_empty() => {
                let duration = start.elapsed();
                debug!(query = %self.query, count = ips.len(), "DNS check successful");
                Ok(ProbeOutcome::healthy(duration))
            }
            Ok(Ok(_)) => {
                warn!(query = %self.query, "DNS check failed: no IPs resolved");
                Ok(ProbeOutcome::unhealthy("No IPs resolved"))
            }
            Ok(Err(e)) => {
                warn!(query = %self.query, error = %e, "DNS check failed");
                Ok(ProbeOutcome::unhealthy(format!("DNS lookup failed: {}", e)))
            }
            Err(_) => {
                warn!(query = %self.query, "DNS check timed out");
                Ok(ProbeOutcome::timeout(self.timeout_duration))
            }
        }
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Dns
    }
}

/// Time allowed for closing a probe session. Fits inside the runner's
/// deadline grace.
pub const CLOSE_BUDGET: Duration = Duration::from_millis(200);

/// Shared plumbing for probes that need a remote session.
#[derive(Clone)]
pub struct RemoteProbe {
    pub target: SessionTarget,
    pub credentials_ref: String,
    pub transport: Arc<dyn RemoteTransport>,
    pub resolver: Arc<dyn CredentialResolver>,
    pub timeout_duration: Duration,
}

impl RemoteProbe {
    /// Open a session, run `commands` in order and always close the session.
    /// Returns the outputs, or the error text to report as a failed probe.
    ///
    /// Connecting and all commands share one deadline of `timeout_duration`;
    /// each command gets an equal share of what is left. Closing is bounded
    /// by [`CLOSE_BUDGET`] so the whole probe ends inside the runner's limit.
    async fn run_commands(
        &self,
        commands: &[&str],
    ) -> Result<Vec<crate::session::CommandOutput>, String> {
        let deadline = tokio::time::Instant::now() + self.timeout_duration;
        let credentials = self
            .resolver
            .resolve(&self.credentials_ref)
            .map_err(|e| e.to_string())?;
        let mut session = match timeout_at(
            deadline,
            self.transport
                .open(&self.target, &credentials, self.timeout_duration),
        )
        .await
        {
            Ok(opened) => opened.map_err(|e| e.to_string())?,
            Err(_) => return Err(timed_out(self.timeout_duration)),
        };

        let mut outputs = Vec::with_capacity(commands.len());
        let mut failure = None;
        for (index, command) in commands.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let share = remaining / (commands.len() - index) as u32;
            if share.is_zero() {
                failure = Some(timed_out(self.timeout_duration));
                break;
            }
            match timeout(share, session.run(command, share)).await {
                Ok(Ok(output)) => outputs.push(output),
                Ok(Err(e)) => {
                    failure = Some(e.to_string());
                    break;
                }
                Err(_) => {
                    failure = Some(timed_out(self.timeout_duration));
                    break;
                }
            }
        }

        if timeout(CLOSE_BUDGET, session.close()).await.is_err() {
            warn!(target = %self.target, "Closing probe session timed out");
        }

        match failure {
            Some(message) => Err(message),
            None => Ok(outputs),
        }
    }
}

fn timed_out(limit: Duration) -> String {
    format!("timed out after {}ms", limit.as_millis())
}

/// Runs one remote command; healthy when it exits 0.
pub struct CommandChecker {
    probe: RemoteProbe,
    command: String,
}

impl CommandChecker {
    pub fn new(probe: RemoteProbe, command: impl Into<String>) -> Self {
        Self {
            probe,
            command: command.into(),
        }
    }
}

#[async_trait]
impl HealthChecker for CommandChecker {
    async fn check(&self) -> Result<ProbeOutcome, CheckError> {
        let start = Instant::now();
        match self.probe.run_commands(&[self.command.as_str()]).await {
            Ok(outputs) => match outputs.first() {
                Some(output) if output.success() => {
                    debug!(target = %self.probe.target, "Command check successful");
                    Ok(ProbeOutcome::healthy(start.elapsed()))
                }
                Some(output) => {
                    warn!(target = %self.probe.target, exit = output.exit_status, "Command check failed");
                    Ok(ProbeOutcome::unhealthy(format!(
                        "command exited with status {}: {}",
                        output.exit_status,
                        excerpt(&output.stderr, 200)
                    )))
                }
                None => Ok(ProbeOutcome::unhealthy("command produced no result")),
            },
            Err(message) => {
                warn!(target = %self.probe.target, error = %message, "Command check failed");
                Ok(ProbeOutcome::unhealthy(message))
            }
        }
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Command
    }
}

pub const CPU_COMMAND: &str =
    "top -bn1 | grep 'Cpu(s)' | sed 's/.*, *\\([0-9.]*\\)%* id.*/\\1/' | awk '{print 100 - $1}'";
pub const MEMORY_COMMAND: &str = "free | grep Mem | awk '{print ($3/$2) * 100.0}'";
pub const DISK_COMMAND: &str = "df -P / | awk 'NR==2 {print $5}' | sed 's/%//'";

/// Samples CPU, memory and disk usage of a Linux host over SSH.
pub struct PerformanceChecker {
    probe: RemoteProbe,
}

impl PerformanceChecker {
    pub fn new(probe: RemoteProbe) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl HealthChecker for PerformanceChecker {
    async fn check(&self) -> Result<ProbeOutcome, CheckError> {
        let start = Instant::now();
        let outputs = match self
            .probe
            .run_commands(&[CPU_COMMAND, MEMORY_COMMAND, DISK_COMMAND])
            .await
        {
            Ok(outputs) => outputs,
            Err(message) => {
                warn!(target = %self.probe.target, error = %message, "Performance sampling failed");
                return Ok(ProbeOutcome::unhealthy(message));
            }
        };

        let value = |i: usize| {
            outputs
                .get(i)
                .filter(|o| o.success())
                .and_then(|o| parse_percentage(&o.stdout))
        };
        let sample = PerformanceSample {
            cpu_usage: value(0),
            memory_usage: value(1),
            disk_usage: value(2),
        };

        if sample.is_empty() {
            return Ok(ProbeOutcome::unhealthy("no performance values could be parsed"));
        }
        debug!(target = %self.probe.target, ?sample, "Performance sample collected");
        Ok(ProbeOutcome::healthy(start.elapsed()).with_metrics(sample))
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Performance
    }
}

/// Parse a percentage printed by the sampling commands, rounded to 2 places.
pub fn parse_percentage(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().trim_end_matches('%').parse().ok()?;
    if !(0.0..=100.0).contains(&value) {
        return None;
    }
    Some((value * 100.0).round() / 100.0)
}

/// Truncate `text` to at most `max` characters.
pub fn excerpt(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
