//! Configuration loading and validation.
//!
//! The YAML file carries fleet-wide settings plus the lab inventory. Device
//! entries are validated one by one: a malformed entry is rejected with a
//! reason while the rest of the fleet loads normally.

use crate::device::{CheckSpec, CommandPolicy, Confirmation, Device, HealingPlan};
pub use crate::device::DeviceOs;
use healthcheck::{CheckKind, CredentialResolver, Credentials, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use validator::{Validate, ValidationError};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "LABGUARD_CONFIG";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

impl From<ConfigError> for common::Error {
    fn from(err: ConfigError) -> Self {
        common::Error::config(err)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub healing: HealingSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub audit: AuditSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Named SSH credentials referenced by devices.
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialEntry>,

    #[serde(default)]
    pub labs: BTreeMap<String, LabEntry>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.monitoring.validate()?;
        self.healing.validate()?;
        self.scheduler.validate()?;
        self.audit.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// Probe cadence and thresholds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MonitoringSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_interval")]
    pub interval: Duration,

    /// Timeout for ping, TCP and DNS probes.
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub http_timeout: Duration,

    /// Timeout for SSH command and performance probes.
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub remote_timeout: Duration,

    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: u32,

    /// Latency samples kept per device.
    #[validate(range(min = 1, max = 10000))]
    pub latency_window: usize,
}

/// Fleet-wide healing settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealingSettings {
    pub enabled: bool,

    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub wait_between_attempts: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_nonzero")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_nonzero")]
    pub command_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_nonzero")]
    pub attempt_ceiling: Duration,

    pub command_policy: CommandPolicy,

    pub confirmation: Confirmation,

    /// Default command sequences for devices without commands of their
    /// own, picked by the declared `os` or detected at attempt time.
    pub playbooks: BTreeMap<DeviceOs, Vec<String>>,
}

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerSettings {
    #[validate(range(min = 1, max = 4096))]
    pub probe_workers: usize,

    #[validate(range(min = 1, max = 256))]
    pub healing_workers: usize,

    #[validate(range(min = 1, max = 1024))]
    pub control_channel: usize,
}

/// Audit journal settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuditSettings {
    pub path: PathBuf,

    /// Records older than this are pruned.
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_nonzero")]
    pub retention: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_nonzero")]
    pub prune_interval: Duration,

    /// Records kept in memory for statistics.
    #[validate(range(min = 100, max = 10000000))]
    pub history_capacity: usize,

    /// `fdatasync` every record.
    pub sync: bool,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl LoggingSettings {
    pub fn json(&self) -> bool {
        self.format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("json"))
    }
}

/// SSH login material. Passwords may come from the environment.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// One lab and its raw device entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Kept raw so one malformed entry cannot fail the whole file.
    #[serde(default)]
    pub devices: Vec<serde_yaml::Value>,
}

/// A device as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub os: Option<DeviceOs>,
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub checks: ChecksEntry,
    #[serde(default)]
    pub healing: DeviceHealingEntry,
}

/// Which probes run against a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChecksEntry {
    pub ping: bool,
    pub http: Option<HttpCheckEntry>,
    pub ports: Vec<u16>,
    pub dns: Option<DnsCheckEntry>,
    pub command: Option<String>,
    pub performance: bool,
    /// Check that drives the health phase.
    pub primary: Option<PrimaryCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCheckEntry {
    pub url: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub verify_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsCheckEntry {
    pub query: String,
    /// Resolve through the device itself (DNS servers).
    #[serde(default)]
    pub via_device: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryCheck {
    Ping,
    Http,
    Tcp,
    Dns,
    Command,
    Performance,
}

impl PrimaryCheck {
    fn matches(&self, kind: &CheckKind) -> bool {
        matches!(
            (self, kind),
            (PrimaryCheck::Ping, CheckKind::Ping)
                | (PrimaryCheck::Http, CheckKind::Http)
                | (PrimaryCheck::Tcp, CheckKind::Tcp { .. })
                | (PrimaryCheck::Dns, CheckKind::Dns)
                | (PrimaryCheck::Command, CheckKind::Command)
                | (PrimaryCheck::Performance, CheckKind::Performance)
        )
    }
}

/// Per-device overrides of the fleet healing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceHealingEntry {
    pub enabled: Option<bool>,
    pub commands: Option<Vec<String>>,
    pub max_attempts: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub wait_between_attempts: Option<Duration>,
    pub command_policy: Option<CommandPolicy>,
    pub confirmation: Option<Confirmation>,
}

/// A device entry that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRejection {
    pub lab: String,
    pub entry: String,
    pub reason: String,
}

impl fmt::Display for DeviceRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.lab, self.entry, self.reason)
    }
}

/// Result of turning the inventory into devices.
#[derive(Debug, Default)]
pub struct DeviceLoad {
    pub devices: Vec<Device>,
    pub rejected: Vec<DeviceRejection>,
}

// Default implementations

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(5),
            remote_timeout: Duration::from_secs(15),
            failure_threshold: 3,
            latency_window: 20,
        }
    }
}

impl Default for HealingSettings {
    fn default() -> Self {
        let mut playbooks = BTreeMap::new();
        playbooks.insert(
            DeviceOs::Linux,
            vec![
                "sudo iptables -D INPUT -p icmp --icmp-type echo-request -j DROP 2>/dev/null || true".to_string(),
                "sudo iptables -I INPUT -p icmp --icmp-type echo-request -j ACCEPT".to_string(),
                "sudo ip route flush cache".to_string(),
                "sudo systemctl restart systemd-resolved 2>/dev/null || true".to_string(),
            ],
        );
        playbooks.insert(
            DeviceOs::Windows,
            vec![
                "netsh advfirewall firewall add rule name=\"Allow ICMP\" protocol=icmpv4:8,any dir=in action=allow".to_string(),
                "ipconfig /flushdns".to_string(),
                "netsh winsock reset".to_string(),
            ],
        );
        Self {
            enabled: true,
            max_attempts: 3,
            wait_between_attempts: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            attempt_ceiling: Duration::from_secs(300),
            command_policy: CommandPolicy::default(),
            confirmation: Confirmation::default(),
            playbooks,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            probe_workers: 64,
            healing_workers: 4,
            control_channel: 8,
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/labguard/audit.jsonl"),
            retention: Duration::from_secs(30 * 24 * 3600),
            prune_interval: Duration::from_secs(3600),
            history_capacity: 200_000,
            sync: true,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9477".to_string(),
        }
    }
}

impl Default for ChecksEntry {
    fn default() -> Self {
        Self {
            ping: true,
            http: None,
            ports: Vec::new(),
            dns: None,
            command: None,
            performance: false,
            primary: None,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_expected_status() -> u16 {
    200
}

// Custom validators

fn validate_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if millis < 100 || millis > 86_400_000 {
        return Err(ValidationError::new("interval_out_of_range"));
    }
    Ok(())
}

fn validate_probe_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if millis < 10 || millis > 600_000 {
        return Err(ValidationError::new("timeout_out_of_range"));
    }
    Ok(())
}

fn validate_nonzero(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        return Err(ValidationError::new("duration_zero"));
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.trim()
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn valid_host(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok()
        || (!address.is_empty()
            && address.len() <= 253
            && address
                .split('.')
                .all(|label| {
                    !label.is_empty()
                        && !label.starts_with('-')
                        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                }))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path));
            }
            tracing::info!("Loading configuration from: {}", path.display());
            return Self::load_from_file(&path);
        }

        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/labguard/labguard.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./labguard.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/labguard/labguard.yaml"))
    }

    /// Credential resolver over the `credentials` section.
    pub fn credential_resolver(&self) -> ConfigCredentials {
        ConfigCredentials {
            entries: self.credentials.clone(),
        }
    }

    /// Validate every device entry. Rejections are logged and returned.
    pub fn load_devices(&self) -> DeviceLoad {
        let mut load = DeviceLoad::default();
        let mut seen = HashSet::new();

        for (lab_id, lab) in &self.labs {
            for (index, raw) in lab.devices.iter().enumerate() {
                let entry_name = entry_name(raw, index);
                let built = serde_yaml::from_value::<DeviceEntry>(raw.clone())
                    .map_err(|e| format!("invalid entry: {}", e))
                    .and_then(|entry| self.build_device(lab_id, entry));

                let result = built.and_then(|device| {
                    if seen.insert(device.id.clone()) {
                        Ok(device)
                    } else {
                        Err(format!("duplicate device id '{}'", device.id))
                    }
                });

                match result {
                    Ok(device) => {
                        if let Some(reason) = &device.unhealable {
                            warn!(device = %device.id, reason = %reason, "Device loaded without healing");
                        }
                        load.devices.push(device);
                    }
                    Err(reason) => {
                        let rejection = DeviceRejection {
                            lab: lab_id.clone(),
                            entry: entry_name,
                            reason,
                        };
                        warn!(rejection = %rejection, "Device entry rejected");
                        load.rejected.push(rejection);
                    }
                }
            }
        }
        load
    }

    fn build_device(&self, lab_id: &str, entry: DeviceEntry) -> Result<Device, String> {
        let address = entry.address.trim().to_string();
        if !valid_host(&address) {
            return Err(format!("invalid address '{}'", entry.address));
        }
        let is_ip = address.parse::<IpAddr>().is_ok();

        let key = entry.id.clone().unwrap_or_else(|| address.clone());
        if key.trim().is_empty() || key.contains('/') {
            return Err(format!("invalid device id '{}'", key));
        }

        let interval = entry.interval.unwrap_or(self.monitoring.interval);
        if interval.is_zero() {
            return Err("interval must be greater than zero".to_string());
        }
        let failure_threshold = entry
            .failure_threshold
            .unwrap_or(self.monitoring.failure_threshold);
        if failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }

        if let Some(reference) = &entry.credentials {
            if !self.credentials.contains_key(reference) {
                return Err(format!("unknown credentials reference '{}'", reference));
            }
        }

        let checks = self.build_checks(&entry, is_ip)?;
        let primary = match entry.checks.primary {
            Some(wanted) => checks
                .iter()
                .position(|c| wanted.matches(&c.kind()))
                .ok_or_else(|| format!("primary check {:?} is not enabled", wanted))?,
            None => checks
                .iter()
                .position(|c| c.kind() == CheckKind::Ping)
                .or_else(|| checks.iter().position(|c| c.kind() == CheckKind::Http))
                .unwrap_or(0),
        };

        let (healing, unhealable) = self.build_healing(&entry);

        Ok(Device {
            id: format!("{}/{}", lab_id, key),
            lab_id: lab_id.to_string(),
            label: entry.label.clone().unwrap_or_else(|| key.clone()),
            address,
            interval,
            failure_threshold,
            latency_window: self.monitoring.latency_window,
            credentials_ref: entry.credentials.clone(),
            ssh_port: entry.ssh_port,
            checks,
            primary,
            healing,
            unhealable,
        })
    }

    fn build_checks(&self, entry: &DeviceEntry, is_ip: bool) -> Result<Vec<CheckSpec>, String> {
        let monitoring = &self.monitoring;
        let spec = &entry.checks;
        let mut checks = Vec::new();

        if spec.ping {
            checks.push(CheckSpec::Ping {
                timeout: monitoring.timeout,
            });
        }
        if let Some(http) = &spec.http {
            let url = http.url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) || url.len() <= 8 {
                return Err(format!("invalid HTTP URL '{}'", http.url));
            }
            checks.push(CheckSpec::Http {
                url: url.to_string(),
                expected_status: http.expected_status,
                verify_tls: http.verify_tls,
                timeout: monitoring.http_timeout,
            });
        }
        for &port in &spec.ports {
            if port == 0 {
                return Err("port 0 is not a valid service port".to_string());
            }
            if !is_ip {
                return Err("port checks need an IP address".to_string());
            }
            checks.push(CheckSpec::Tcp {
                port,
                timeout: monitoring.timeout,
            });
        }
        if let Some(dns) = &spec.dns {
            if dns.query.trim().is_empty() {
                return Err("DNS check needs a query".to_string());
            }
            if dns.via_device && !is_ip {
                return Err("DNS checks through the device need an IP address".to_string());
            }
            checks.push(CheckSpec::Dns {
                query: dns.query.trim().to_string(),
                via_device: dns.via_device,
                timeout: monitoring.timeout,
            });
        }
        let remote = spec.command.is_some() || spec.performance;
        if remote && entry.credentials.is_none() {
            return Err("command and performance checks need credentials".to_string());
        }
        if let Some(command) = &spec.command {
            checks.push(CheckSpec::Command {
                command: command.clone(),
                timeout: monitoring.remote_timeout,
            });
        }
        if spec.performance {
            checks.push(CheckSpec::Performance {
                timeout: monitoring.remote_timeout,
            });
        }

        if checks.is_empty() {
            return Err("no checks enabled".to_string());
        }
        Ok(checks)
    }

    /// Healing misconfiguration never rejects a device; it makes it
    /// unhealable instead.
    fn build_healing(&self, entry: &DeviceEntry) -> (HealingPlan, Option<String>) {
        let global = &self.healing;
        let overrides = &entry.healing;

        let commands = overrides
            .commands
            .clone()
            .or_else(|| entry.os.and_then(|os| global.playbooks.get(&os).cloned()))
            .unwrap_or_default();
        // Without a declared os the playbook is chosen after detection.
        let playbooks = if overrides.commands.is_none() && entry.os.is_none() {
            global.playbooks.clone()
        } else {
            BTreeMap::new()
        };

        let plan = HealingPlan {
            enabled: overrides.enabled.unwrap_or(global.enabled),
            commands,
            max_attempts: overrides.max_attempts.unwrap_or(global.max_attempts),
            wait_between_attempts: overrides
                .wait_between_attempts
                .unwrap_or(global.wait_between_attempts),
            connect_timeout: global.connect_timeout,
            command_timeout: global.command_timeout,
            attempt_ceiling: global.attempt_ceiling,
            command_policy: overrides.command_policy.unwrap_or(global.command_policy),
            confirmation: overrides.confirmation.unwrap_or(global.confirmation),
            playbooks,
        };

        let unhealable = if !plan.enabled {
            None
        } else if plan.max_attempts == 0 {
            Some("healing max_attempts is 0".to_string())
        } else if plan.commands.is_empty() && !plan.detects_os() {
            Some("healing enabled but no commands configured".to_string())
        } else if entry.credentials.is_none() {
            Some("healing enabled but no SSH credentials configured".to_string())
        } else {
            None
        };
        (plan, unhealable)
    }
}

fn entry_name(raw: &serde_yaml::Value, index: usize) -> String {
    ["id", "address", "ip"]
        .iter()
        .find_map(|key| raw.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("#{}", index))
}

/// Resolves the `credentials` section, reading `password_env` at resolve
/// time so rotated secrets are picked up without a restart.
#[derive(Debug, Clone, Default)]
pub struct ConfigCredentials {
    entries: BTreeMap<String, CredentialEntry>,
}

impl CredentialResolver for ConfigCredentials {
    fn resolve(&self, reference: &str) -> Result<Credentials, SessionError> {
        let entry = self.entries.get(reference).ok_or_else(|| {
            SessionError::Credentials(format!("unknown reference '{}'", reference))
        })?;

        let password = match (&entry.password, &entry.password_env) {
            (Some(password), _) => Some(password.clone()),
            (None, Some(var)) => match std::env::var(var) {
                Ok(value) => Some(value),
                Err(_) if entry.identity_file.is_some() => None,
                Err(_) => {
                    return Err(SessionError::Credentials(format!(
                        "environment variable {} is not set",
                        var
                    )));
                }
            },
            (None, None) => None,
        };

        Ok(Credentials {
            username: entry.username.clone(),
            password,
            identity_file: entry.identity_file.as_deref().map(expand_home),
        })
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
monitoring:
  interval: 15s
  failure_threshold: 2

healing:
  max_attempts: 2
  wait_between_attempts: 1m

credentials:
  lab-admin:
    username: admin
    password: secret

labs:
  lab1:
    name: Computer Lab 1
    location: Building A
    devices:
      - ip: 192.168.1.100
        label: PC-01
        os: linux
        credentials: lab-admin
        checks:
          ports: [22]
      - id: web
        address: 192.168.1.10
        credentials: lab-admin
        checks:
          ping: false
          http:
            url: http://192.168.1.10/health
        healing:
          commands: ["systemctl restart nginx"]
          confirmation: trust
      - address: 192.168.1.101
        label: PC-02
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.load_devices().devices.is_empty());
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let config = Config::from_yaml(INVENTORY).unwrap();
        assert_eq!(config.monitoring.interval, Duration::from_secs(15));
        assert_eq!(config.monitoring.failure_threshold, 2);
        // Untouched fields keep their defaults.
        assert_eq!(config.monitoring.timeout, Duration::from_secs(2));
        assert_eq!(config.healing.wait_between_attempts, Duration::from_secs(60));
        assert_eq!(config.labs["lab1"].name.as_deref(), Some("Computer Lab 1"));
        assert_eq!(config.labs["lab1"].devices.len(), 3);
    }

    #[test]
    fn test_load_devices() {
        let config = Config::from_yaml(INVENTORY).unwrap();
        let load = config.load_devices();
        assert!(load.rejected.is_empty(), "{:?}", load.rejected);
        assert_eq!(load.devices.len(), 3);

        let pc = &load.devices[0];
        assert_eq!(pc.id, "lab1/192.168.1.100");
        assert_eq!(pc.label, "PC-01");
        assert_eq!(pc.interval, Duration::from_secs(15));
        assert_eq!(pc.failure_threshold, 2);
        assert_eq!(pc.primary_kind(), CheckKind::Ping);
        assert_eq!(pc.checks.len(), 2);
        // Linux playbook applied.
        assert!(pc.healing.commands[0].contains("iptables"));
        assert_eq!(pc.healing.max_attempts, 2);
        assert!(pc.can_heal());

        let web = &load.devices[1];
        assert_eq!(web.id, "lab1/web");
        assert_eq!(web.primary_kind(), CheckKind::Http);
        assert_eq!(web.healing.confirmation, Confirmation::Trust);

        let bare = &load.devices[2];
        assert!(bare.healing.enabled);
        assert!(bare.healing.detects_os());
        assert_eq!(
            bare.unhealable.as_deref(),
            Some("healing enabled but no SSH credentials configured")
        );
    }

    #[test]
    fn test_undeclared_os_detects_playbook() {
        let yaml = r#"
credentials:
  lab-admin:
    username: admin
labs:
  lab1:
    devices:
      - address: 10.0.0.1
        credentials: lab-admin
      - address: 10.0.0.2
        os: windows
        credentials: lab-admin
      - address: 10.0.0.3
        credentials: lab-admin
        healing:
          commands: []
      - address: 10.0.0.4
        credentials: lab-admin
        healing:
          max_attempts: 0
"#;
        let load = Config::from_yaml(yaml).unwrap().load_devices();
        assert!(load.rejected.is_empty(), "{:?}", load.rejected);
        assert_eq!(load.devices.len(), 4);

        let detect = &load.devices[0];
        assert!(detect.healing.commands.is_empty());
        assert_eq!(detect.healing.playbooks.len(), 2);
        assert!(detect.can_heal());

        let declared = &load.devices[1];
        assert!(declared.healing.playbooks.is_empty());
        assert!(declared.healing.commands.iter().any(|c| c.contains("winsock")));

        let explicit_empty = &load.devices[2];
        assert_eq!(
            explicit_empty.unhealable.as_deref(),
            Some("healing enabled but no commands configured")
        );

        let no_attempts = &load.devices[3];
        assert!(!no_attempts.can_heal());
        assert!(no_attempts.unhealable.as_deref().unwrap().contains("max_attempts"));
    }

    #[test]
    fn test_malformed_entries_rejected_with_reason() {
        let yaml = r#"
credentials:
  lab-admin:
    username: admin
labs:
  lab1:
    devices:
      - address: "not an address!"
      - address: 10.0.0.1
        credentials: nobody
      - address: 10.0.0.2
        interval: 0s
      - address: 10.0.0.3
        checks:
          http:
            url: ftp://10.0.0.3
      - label: no-address
      - address: 10.0.0.4
      - address: 10.0.0.4
      - address: 10.0.0.5
        checks:
          ping: false
      - address: 10.0.0.6
        checks:
          primary: dns
      - address: 10.0.0.7
        checks:
          performance: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let load = config.load_devices();

        assert_eq!(load.devices.len(), 1);
        assert_eq!(load.devices[0].id, "lab1/10.0.0.4");

        let reasons: Vec<&str> = load.rejected.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(reasons.len(), 9);
        assert!(reasons[0].starts_with("invalid address"));
        assert!(reasons[1].contains("unknown credentials reference"));
        assert!(reasons[2].contains("interval"));
        assert!(reasons[3].contains("invalid HTTP URL"));
        assert!(reasons[4].starts_with("invalid entry"));
        assert!(reasons[5].contains("duplicate"));
        assert_eq!(reasons[6], "no checks enabled");
        assert!(reasons[7].contains("primary"));
        assert!(reasons[8].contains("need credentials"));

        assert_eq!(load.rejected[1].entry, "10.0.0.1");
        assert_eq!(load.rejected[4].entry, "#4");
        assert_eq!(load.rejected[1].to_string(), "lab1/10.0.0.1: unknown credentials reference 'nobody'");
    }

    #[test]
    fn test_healing_without_credentials_is_unhealable() {
        let yaml = r#"
labs:
  lab1:
    devices:
      - address: 10.0.0.1
        healing:
          commands: ["reboot"]
      - address: 10.0.0.2
        healing:
          enabled: false
"#;
        let load = Config::from_yaml(yaml).unwrap().load_devices();
        assert_eq!(load.devices.len(), 2);
        assert!(load.devices[0].unhealable.as_deref().unwrap().contains("credentials"));
        assert!(load.devices[1].unhealable.is_none());
        assert!(!load.devices[1].can_heal());
    }

    #[test]
    fn test_invalid_settings() {
        let yaml = r#"
monitoring:
  failure_threshold: 0
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::ValidationError(_))
        ));

        let yaml = r#"
metrics:
  listen_addr: "nowhere"
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
monitoring:
  interval: 5ms
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
scheduler:
  healing_workers: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_humantime_serde_parsing() {
        let yaml = r#"
audit:
  retention: 7d
  prune_interval: 30m
healing:
  attempt_ceiling: 2m
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.audit.retention, Duration::from_secs(7 * 86_400));
        assert_eq!(config.audit.prune_interval, Duration::from_secs(1800));
        assert_eq!(config.healing.attempt_ceiling, Duration::from_secs(120));
    }

    #[test]
    fn test_credential_resolver() {
        let yaml = r#"
credentials:
  inline:
    username: admin
    password: hunter2
  from-env:
    username: admin
    password_env: LABGUARD_TEST_SURELY_UNSET_PASSWORD
  key-only:
    username: ops
    password_env: LABGUARD_TEST_SURELY_UNSET_PASSWORD
    identity_file: /etc/labguard/id_ed25519
"#;
        let resolver = Config::from_yaml(yaml).unwrap().credential_resolver();

        let inline = resolver.resolve("inline").unwrap();
        assert_eq!(inline.password.as_deref(), Some("hunter2"));

        assert!(matches!(
            resolver.resolve("from-env"),
            Err(SessionError::Credentials(_))
        ));
        assert!(matches!(
            resolver.resolve("missing"),
            Err(SessionError::Credentials(_))
        ));

        let key_only = resolver.resolve("key-only").unwrap();
        assert!(key_only.password.is_none());
        assert_eq!(
            key_only.identity_file,
            Some(PathBuf::from("/etc/labguard/id_ed25519"))
        );
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let entry = CredentialEntry {
            username: "admin".to_string(),
            password: Some("hunter2".to_string()),
            password_env: None,
            identity_file: None,
        };
        assert!(!format!("{:?}", entry).contains("hunter2"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = Config::load_from_file("/nonexistent/labguard.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labguard.yaml");
        std::fs::write(&path, INVENTORY).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.load_devices().devices.len(), 3);
    }

    #[test]
    fn test_valid_host() {
        assert!(valid_host("10.1.2.3"));
        assert!(valid_host("fe80::1"));
        assert!(valid_host("printer-1.lab.local"));
        assert!(!valid_host(""));
        assert!(!valid_host("bad host"));
        assert!(!valid_host("-lead.example"));
    }
}
