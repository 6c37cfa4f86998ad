//! Remote command sessions.
//!
//! Sessions are acquired per operation and released right after. Nothing
//! here pools or reuses a session across devices or attempts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Remote session errors. None of these are process-fatal: callers turn
/// them into failed checks or failed healing attempts.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("authentication failed for {0}")]
    Authentication(String),

    #[error("connection to {target} failed: {message}")]
    Connect { target: String, message: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("command could not be executed: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Login material for a remote session.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// Resolves a named credentials reference.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<Credentials, SessionError>;
}

/// Resolver over a fixed table, typically built from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: impl Into<String>, credentials: Credentials) {
        self.entries.insert(reference.into(), credentials);
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.entries.contains_key(reference)
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, reference: &str) -> Result<Credentials, SessionError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| SessionError::Credentials(format!("unknown reference '{}'", reference)))
    }
}

/// Where to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub address: String,
    pub port: u16,
}

impl SessionTarget {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Opens command sessions to remote hosts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn open(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError>;
}

/// An open command channel. `close` must be called on every exit path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSession: Send {
    async fn run(&mut self, command: &str, timeout: Duration)
    -> Result<CommandOutput, SessionError>;

    async fn close(&mut self);
}

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Transport backed by the system OpenSSH client.
///
/// Each session starts a dedicated control master; commands are multiplexed
/// over it and `close` tears it down. Password logins go through `sshpass`.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    ssh_program: PathBuf,
    control_dir: PathBuf,
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl OpenSshTransport {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            control_dir: control_dir.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.ssh_program = program.into();
        self
    }

    fn control_path(&self) -> PathBuf {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        self.control_dir
            .join(format!("labguard-{}-{}.ctl", std::process::id(), seq))
    }

    fn base_command(&self, credentials: &Credentials) -> Command {
        let mut cmd = match &credentials.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(&self.ssh_program).env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.ssh_program);
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "LogLevel=ERROR"])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(identity) = &credentials.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd
    }
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn open(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        let control_path = self.control_path();
        let destination = format!("{}@{}", credentials.username, target.address);

        let mut cmd = self.base_command(credentials);
        cmd.args(["-M", "-N"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(target.port.to_string())
            .arg(&destination)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut master = cmd.spawn()?;
        let started = Instant::now();

        // The master is usable once its control socket shows up.
        loop {
            if control_path.exists() {
                debug!(target = %target, "SSH session established");
                return Ok(Box::new(OpenSshSession {
                    ssh_program: self.ssh_program.clone(),
                    control_path,
                    destination,
                    master: Some(master),
                }));
            }

            if let Some(status) = master.try_wait()? {
                let stderr = read_stderr(&mut master).await;
                remove_quietly(&control_path);
                return Err(classify_connect_failure(target, status.code(), stderr));
            }

            if started.elapsed() >= connect_timeout {
                let _ = master.kill().await;
                remove_quietly(&control_path);
                return Err(SessionError::Timeout(connect_timeout));
            }

            sleep(Duration::from_millis(50)).await;
        }
    }
}

struct OpenSshSession {
    ssh_program: PathBuf,
    control_path: PathBuf,
    destination: String,
    master: Option<Child>,
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn run(
        &mut self,
        command: &str,
        limit: Duration,
    ) -> Result<CommandOutput, SessionError> {
        if self.master.is_none() {
            return Err(SessionError::Command("session already closed".to_string()));
        }

        let child = Command::new(&self.ssh_program)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                // ssh reports 255 for its own failures; a signal leaves no code
                exit_status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(Err(e)) => Err(SessionError::Io(e)),
            Err(_) => Err(SessionError::Timeout(limit)),
        }
    }

    async fn close(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };

        let exit = Command::new(&self.ssh_program)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        if timeout(Duration::from_secs(2), exit).await.is_err() {
            warn!(destination = %self.destination, "SSH control master did not exit in time");
        }
        let _ = master.kill().await;
        remove_quietly(&self.control_path);
        debug!(destination = %self.destination, "SSH session closed");
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        // kill_on_drop reaps the master if close was skipped
        if self.master.is_some() {
            remove_quietly(&self.control_path);
        }
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf.trim().to_string()
}

fn remove_quietly(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn classify_connect_failure(
    target: &SessionTarget,
    code: Option<i32>,
    stderr: String,
) -> SessionError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission denied") || code == Some(5) {
        // sshpass exits 5 on a rejected password
        SessionError::Authentication(target.to_string())
    } else {
        SessionError::Connect {
            target: target.to_string(),
            message: if stderr.is_empty() {
                format!("ssh exited with status {:?}", code)
            } else {
                stderr
            },
        }
    }
}
