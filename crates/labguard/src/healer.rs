//! Remote recovery of failing devices.

use crate::device::{CommandPolicy, Device, DeviceOs, HealingPlan};
use crate::types::{CommandOutcome, HealingAttempt};
use chrono::Utc;
use healthcheck::checkers::excerpt;
use healthcheck::{CredentialResolver, RemoteSession, RemoteTransport, SessionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Slack given to transport calls on top of their own timeouts.
const CALL_GRACE: Duration = Duration::from_secs(1);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const EXCERPT_LEN: usize = 200;
const DETECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Commands tried in order to identify the remote operating system. Each
/// must exit 0 and its output must be recognised.
const OS_PROBES: [(&str, fn(&str) -> Option<DeviceOs>); 4] = [
    ("ver", windows_banner),
    ("uname -s", unix_kernel),
    ("echo %OS%", windows_env),
    ("cat /etc/os-release 2>/dev/null | head -n 1", os_release),
];

fn windows_banner(out: &str) -> Option<DeviceOs> {
    let out = out.to_lowercase();
    (out.contains("windows") || out.contains("microsoft")).then_some(DeviceOs::Windows)
}

/// macOS is healed with the Linux playbook.
fn unix_kernel(out: &str) -> Option<DeviceOs> {
    let out = out.to_lowercase();
    (out.contains("linux") || out.contains("darwin")).then_some(DeviceOs::Linux)
}

fn windows_env(out: &str) -> Option<DeviceOs> {
    out.contains("Windows").then_some(DeviceOs::Windows)
}

fn os_release(out: &str) -> Option<DeviceOs> {
    (!out.trim().is_empty()).then_some(DeviceOs::Linux)
}

/// Runs a device's healing commands over one remote session.
///
/// Single-flight per device is the state machine's job, not this type's.
pub struct HealingExecutor {
    transport: Arc<dyn RemoteTransport>,
    resolver: Arc<dyn CredentialResolver>,
}

impl HealingExecutor {
    pub fn new(transport: Arc<dyn RemoteTransport>, resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            transport,
            resolver,
        }
    }

    /// Run attempt number `attempt` against `device`.
    ///
    /// Never fails: session and command problems are recorded in the
    /// returned [`HealingAttempt`]. An opened session is closed on every
    /// path. Connecting, detection and commands share one deadline.
    pub async fn heal(&self, device: &Device, attempt: u32) -> HealingAttempt {
        let plan = &device.healing;
        let started_at = Utc::now();
        let budget = plan.attempt_deadline();
        let deadline = Instant::now() + budget;
        info!(device = %device.id, attempt, commands = plan.commands.len(), "Starting healing attempt");

        let mut record = HealingAttempt {
            device_id: device.id.clone(),
            attempt,
            started_at,
            finished_at: started_at,
            session_established: false,
            session_error: None,
            detected_os: None,
            timed_out: false,
            commands: Vec::with_capacity(plan.commands.len()),
            success: false,
        };

        let mut session = match self.open_session(device, deadline).await {
            Ok(session) => session,
            Err(e) => {
                warn!(device = %device.id, attempt, error = %e, "Healing session could not be opened");
                record.session_error = Some(e.to_string());
                record.commands = plan
                    .commands
                    .iter()
                    .map(|c| CommandOutcome::not_executed(c, "no session"))
                    .collect();
                return finish(record, plan);
            }
        };
        record.session_established = true;

        let commands = if plan.detects_os() {
            match timeout_at(deadline, detect_os(session.as_mut())).await {
                Ok(Some(os)) => {
                    info!(device = %device.id, os = %os, "Detected operating system");
                    record.detected_os = Some(os);
                    plan.playbooks.get(&os).cloned().unwrap_or_default()
                }
                Ok(None) => {
                    warn!(device = %device.id, "Operating system could not be detected");
                    record.session_error =
                        Some("operating system could not be detected".to_string());
                    Vec::new()
                }
                Err(_) => {
                    record.timed_out = true;
                    Vec::new()
                }
            }
        } else {
            plan.commands.clone()
        };

        if !commands.is_empty() {
            let timed_out = timeout_at(
                deadline,
                run_commands(session.as_mut(), device, &commands, &mut record.commands),
            )
            .await
            .is_err();
            if timed_out {
                record.timed_out = true;
                let done = record.commands.len();
                record.commands.extend(
                    commands[done..]
                        .iter()
                        .map(|c| CommandOutcome::not_executed(c, "attempt deadline reached")),
                );
            }
        }

        if timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
            warn!(device = %device.id, "Closing healing session timed out");
        }

        if record.timed_out {
            warn!(device = %device.id, attempt, deadline_ms = budget.as_millis() as u64, "Healing attempt deadline reached");
        }
        finish(record, plan)
    }

    async fn open_session(
        &self,
        device: &Device,
        deadline: Instant,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        let reference = device.credentials_ref.as_deref().ok_or_else(|| {
            SessionError::Credentials("no credentials reference configured".to_string())
        })?;
        let credentials = self.resolver.resolve(reference)?;
        let connect_timeout = device.healing.connect_timeout;
        let limit = deadline.min(Instant::now() + connect_timeout + CALL_GRACE);

        match timeout_at(
            limit,
            self.transport
                .open(&device.session_target(), &credentials, connect_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(connect_timeout)),
        }
    }
}

/// First operating system recognised by [`OS_PROBES`], if any.
async fn detect_os(session: &mut dyn RemoteSession) -> Option<DeviceOs> {
    for (command, recognise) in OS_PROBES {
        let run = session.run(command, DETECT_TIMEOUT);
        match timeout(DETECT_TIMEOUT + CALL_GRACE, run).await {
            Ok(Ok(output)) if output.exit_status == 0 => {
                if let Some(os) = recognise(&output.stdout) {
                    return Some(os);
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(command, error = %e, "Detection command failed"),
            Err(_) => debug!(command, "Detection command timed out"),
        }
    }
    None
}

/// Run every command in order; a failing command does not stop the rest.
async fn run_commands(
    session: &mut dyn RemoteSession,
    device: &Device,
    commands: &[String],
    outcomes: &mut Vec<CommandOutcome>,
) {
    let command_timeout = device.healing.command_timeout;
    for command in commands {
        let run = session.run(command, command_timeout);
        let result = match timeout(command_timeout + CALL_GRACE, run).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(command_timeout)),
        };

        let outcome = match result {
            Ok(output) => {
                let text = if output.stdout.trim().is_empty() {
                    &output.stderr
                } else {
                    &output.stdout
                };
                CommandOutcome {
                    command: command.clone(),
                    exit_status: Some(output.exit_status),
                    error: None,
                    output_excerpt: excerpt(text.trim(), EXCERPT_LEN),
                }
            }
            Err(e) => CommandOutcome {
                command: command.clone(),
                exit_status: None,
                error: Some(e.to_string()),
                output_excerpt: String::new(),
            },
        };

        if outcome.succeeded() {
            debug!(device = %device.id, command = %command, "Healing command succeeded");
        } else {
            warn!(device = %device.id, command = %command, exit = ?outcome.exit_status,
                  error = ?outcome.error, "Healing command failed");
        }
        outcomes.push(outcome);
    }
}

fn finish(mut record: HealingAttempt, plan: &HealingPlan) -> HealingAttempt {
    record.finished_at = Utc::now();
    let commands_ok = match plan.command_policy {
        CommandPolicy::Executed => record.commands.iter().all(CommandOutcome::executed),
        CommandPolicy::ZeroExit => record.commands.iter().all(CommandOutcome::succeeded),
    };
    record.success = record.session_established
        && record.session_error.is_none()
        && !record.timed_out
        && !record.commands.is_empty()
        && commands_ok;
    info!(
        device = %record.device_id,
        attempt = record.attempt,
        success = record.success,
        "Healing attempt finished"
    );
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fixtures;
    use async_trait::async_trait;
    use healthcheck::{CommandOutput, Credentials, SessionTarget, StaticCredentials};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Step {
        Exit(i32),
        Reply(i32, &'static str),
        Slow(Duration),
        Fail(&'static str),
        Hang,
    }

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        ran: Mutex<Vec<String>>,
    }

    struct FakeSession {
        steps: Vec<Step>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn run(
            &mut self,
            command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, SessionError> {
            self.counters.ran.lock().unwrap().push(command.to_string());
            let step = if self.steps.is_empty() {
                Step::Exit(0)
            } else {
                self.steps.remove(0)
            };
            match step {
                Step::Exit(code) => Ok(CommandOutput {
                    exit_status: code,
                    stdout: format!("ran {}", command),
                    stderr: String::new(),
                }),
                Step::Reply(code, stdout) => Ok(CommandOutput {
                    exit_status: code,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
                Step::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(CommandOutput {
                        exit_status: 0,
                        stdout: String::new(),
                        stderr: String::new(),
                    })
                }
                Step::Fail(message) => Err(SessionError::Command(message.to_string())),
                Step::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn close(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeTransport {
        refuse: Option<&'static str>,
        connect_delay: Duration,
        steps: Vec<Step>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl RemoteTransport for FakeTransport {
        async fn open(
            &self,
            target: &SessionTarget,
            _credentials: &Credentials,
            _connect_timeout: Duration,
        ) -> Result<Box<dyn RemoteSession>, SessionError> {
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            if let Some(message) = self.refuse {
                return Err(SessionError::Authentication(format!("{}: {}", target, message)));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                steps: self.steps.clone(),
                counters: self.counters.clone(),
            }))
        }
    }

    fn executor(refuse: Option<&'static str>, steps: Vec<Step>) -> (HealingExecutor, Arc<Counters>) {
        slow_executor(refuse, Duration::ZERO, steps)
    }

    fn slow_executor(
        refuse: Option<&'static str>,
        connect_delay: Duration,
        steps: Vec<Step>,
    ) -> (HealingExecutor, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let transport = FakeTransport {
            refuse,
            connect_delay,
            steps,
            counters: counters.clone(),
        };
        let mut credentials = StaticCredentials::new();
        credentials.insert(
            "lab-admin",
            Credentials {
                username: "admin".to_string(),
                ..Default::default()
            },
        );
        (
            HealingExecutor::new(Arc::new(transport), Arc::new(credentials)),
            counters,
        )
    }

    /// Device whose playbook is picked by detection.
    fn detecting_device() -> Device {
        let mut device = device(&[]);
        device
            .healing
            .playbooks
            .insert(DeviceOs::Linux, vec!["ip route flush cache".to_string()]);
        device
            .healing
            .playbooks
            .insert(DeviceOs::Windows, vec!["ipconfig /flushdns".to_string()]);
        device
    }

    fn device(commands: &[&str]) -> Device {
        let mut device = fixtures::device("lab1/pc-01");
        device.healing.commands = commands.iter().map(|c| c.to_string()).collect();
        device.healing.command_timeout = Duration::from_secs(5);
        device
    }

    #[tokio::test]
    async fn test_all_commands_run_in_order() {
        let (executor, counters) = executor(None, vec![]);
        let device = device(&["ipconfig /release", "ipconfig /renew"]);

        let attempt = executor.heal(&device, 1).await;
        assert!(attempt.success);
        assert!(attempt.session_established);
        assert_eq!(attempt.attempt, 1);
        assert_eq!(
            *counters.ran.lock().unwrap(),
            vec!["ipconfig /release", "ipconfig /renew"]
        );
        assert_eq!(attempt.commands[1].output_excerpt, "ran ipconfig /renew");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert!(attempt.finished_at >= attempt.started_at);
    }

    #[tokio::test]
    async fn test_failed_command_does_not_abort_sequence() {
        let (executor, counters) = executor(None, vec![Step::Fail("broken pipe"), Step::Exit(0)]);
        let device = device(&["first", "second"]);

        let attempt = executor.heal(&device, 2).await;
        assert_eq!(attempt.commands.len(), 2);
        assert!(attempt.commands[0].error.is_some());
        assert!(attempt.commands[1].succeeded());
        // Not every command produced an exit status.
        assert!(!attempt.success);
        assert_eq!(counters.ran.lock().unwrap().len(), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_policy() {
        let steps = vec![Step::Exit(3), Step::Exit(0)];

        let (lenient, _) = executor(None, steps.clone());
        let attempt = lenient.heal(&device(&["a", "b"]), 1).await;
        assert!(attempt.success);

        let (strict_executor, _) = executor(None, steps);
        let mut strict = device(&["a", "b"]);
        strict.healing.command_policy = CommandPolicy::ZeroExit;
        let attempt = strict_executor.heal(&strict, 1).await;
        assert!(!attempt.success);
        assert!(attempt.failure_detail().unwrap().contains("exited with 3"));
    }

    #[tokio::test]
    async fn test_authentication_failure_is_failed_attempt() {
        let (executor, counters) = executor(Some("permission denied"), vec![]);
        let attempt = executor.heal(&device(&["reboot"]), 1).await;

        assert!(!attempt.success);
        assert!(!attempt.session_established);
        assert!(attempt.session_error.unwrap().contains("authentication failed"));
        assert_eq!(attempt.commands.len(), 1);
        assert!(!attempt.commands[0].executed());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_credentials_is_failed_attempt() {
        let (executor, _) = executor(None, vec![]);
        let mut device = device(&["reboot"]);
        device.credentials_ref = Some("missing".to_string());

        let attempt = executor.heal(&device, 1).await;
        assert!(!attempt.success);
        assert!(attempt.session_error.unwrap().contains("credentials"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_command_hits_deadline_and_closes() {
        let (executor, counters) = executor(None, vec![Step::Exit(0), Step::Hang]);
        let mut device = device(&["one", "two", "three"]);
        device.healing.command_timeout = Duration::from_secs(30);
        device.healing.attempt_ceiling = Duration::from_secs(10);

        let attempt = executor.heal(&device, 1).await;
        assert!(attempt.timed_out);
        assert!(!attempt.success);
        assert_eq!(attempt.commands.len(), 3);
        assert!(attempt.commands[0].succeeded());
        assert!(!attempt.commands[1].executed());
        assert_eq!(
            attempt.commands[2].error.as_deref(),
            Some("attempt deadline reached")
        );
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detected_os_selects_playbook() {
        let (executor, counters) = executor(
            None,
            vec![Step::Reply(127, ""), Step::Reply(0, "Linux\n"), Step::Exit(0)],
        );
        let device = detecting_device();
        assert!(device.healing.detects_os());

        let attempt = executor.heal(&device, 1).await;
        assert!(attempt.success);
        assert_eq!(attempt.detected_os, Some(DeviceOs::Linux));
        assert_eq!(
            *counters.ran.lock().unwrap(),
            vec!["ver", "uname -s", "ip route flush cache"]
        );
        assert_eq!(attempt.commands.len(), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_windows_detected_from_ver() {
        let (executor, counters) = executor(
            None,
            vec![Step::Reply(0, "Microsoft Windows [Version 10.0.19045]")],
        );
        let attempt = executor.heal(&detecting_device(), 1).await;
        assert_eq!(attempt.detected_os, Some(DeviceOs::Windows));
        assert_eq!(counters.ran.lock().unwrap()[1], "ipconfig /flushdns");
    }

    #[tokio::test]
    async fn test_undetected_os_fails_attempt() {
        let (executor, counters) = executor(None, vec![Step::Reply(1, ""); 4]);
        let attempt = executor.heal(&detecting_device(), 1).await;

        assert!(!attempt.success);
        assert!(attempt.session_established);
        assert!(attempt.detected_os.is_none());
        assert!(attempt.commands.is_empty());
        assert!(attempt.failure_detail().unwrap().contains("could not be detected"));
        assert_eq!(counters.ran.lock().unwrap().len(), 4);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_time_counts_against_deadline() {
        let step = Step::Slow(Duration::from_millis(1500));
        let (executor, counters) =
            slow_executor(None, Duration::from_secs(8), vec![step.clone(), step.clone(), step]);
        let mut device = device(&["one", "two", "three"]);
        device.healing.attempt_ceiling = Duration::from_secs(10);

        let began = tokio::time::Instant::now();
        let attempt = executor.heal(&device, 1).await;

        assert!(attempt.timed_out);
        assert!(!attempt.success);
        assert!(attempt.commands[0].succeeded());
        assert!(!attempt.commands[1].executed());
        assert!(began.elapsed() < Duration::from_secs(11));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }
}
