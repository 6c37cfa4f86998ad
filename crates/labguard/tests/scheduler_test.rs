//! Integration tests for the Scheduler

use async_trait::async_trait;
use healthcheck::{
    CheckError, CheckKind, CheckRunner, CommandOutput, Credentials, HealthChecker, ProbeOutcome,
    RemoteSession, RemoteTransport, SessionError, SessionTarget, StaticCredentials,
};
use labguard::config::SchedulerSettings;
use labguard::{
    AuditEvent, AuditLog, CheckSpec, CoreError, Device, HealingExecutor, HealingPlan,
    MonitoredDevice, Phase, Scheduler, SchedulerHandle, StatusStore,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ping checker that replays a script, then repeats `fallback`.
struct ScriptedChecker {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    delay: Duration,
    calls: AtomicUsize,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ScriptedChecker {
    fn new(script: &[bool], fallback: bool) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn slow(delay: Duration, running: Arc<AtomicUsize>, max_running: Arc<AtomicUsize>) -> Self {
        Self {
            delay,
            running,
            max_running,
            ..Self::new(&[], true)
        }
    }
}

#[async_trait]
impl HealthChecker for ScriptedChecker {
    async fn check(&self) -> Result<ProbeOutcome, CheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let healthy = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if healthy {
            Ok(ProbeOutcome::healthy(Duration::from_millis(1)))
        } else {
            Ok(ProbeOutcome::unhealthy("host unreachable"))
        }
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Ping
    }
}

/// Transport whose sessions either refuse authentication or run every
/// command with exit status 0, optionally after `session_delay`.
#[derive(Default)]
struct FakeTransport {
    refuse: bool,
    session_delay: Duration,
    opens: AtomicUsize,
    open_sessions: Arc<AtomicUsize>,
    max_open_sessions: Arc<AtomicUsize>,
}

struct FakeSession {
    delay: Duration,
    open_sessions: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(&mut self, _command: &str, _timeout: Duration) -> Result<CommandOutput, SessionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(CommandOutput {
            exit_status: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
        })
    }

    async fn close(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn open(
        &self,
        target: &SessionTarget,
        _credentials: &Credentials,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(SessionError::Authentication(target.to_string()));
        }
        let now_open = self.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_sessions.fetch_max(now_open, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            delay: self.session_delay,
            open_sessions: self.open_sessions.clone(),
        }))
    }
}

/// Helper to create a ping-only device with fast cadence
fn device(id: &str, max_attempts: u32) -> Device {
    Device {
        id: id.to_string(),
        lab_id: "lab1".to_string(),
        label: id.to_string(),
        address: "192.0.2.10".to_string(),
        interval: Duration::from_millis(20),
        failure_threshold: 3,
        latency_window: 10,
        credentials_ref: Some("lab-admin".to_string()),
        ssh_port: 22,
        checks: vec![CheckSpec::Ping {
            timeout: Duration::from_millis(500),
        }],
        primary: 0,
        healing: HealingPlan {
            enabled: true,
            commands: vec!["systemctl restart networking".to_string()],
            max_attempts,
            wait_between_attempts: Duration::ZERO,
            connect_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
            ..HealingPlan::disabled()
        },
        unhealable: None,
    }
}

struct Harness {
    handle: SchedulerHandle,
    store: StatusStore,
    audit: Arc<AuditLog>,
    transport: Arc<FakeTransport>,
}

fn start(
    devices: Vec<(Device, Arc<ScriptedChecker>)>,
    refuse: bool,
    probe_workers: usize,
) -> Harness {
    let transport = Arc::new(FakeTransport {
        refuse,
        ..Default::default()
    });
    start_with(devices, transport, probe_workers, 2)
}

fn start_with(
    devices: Vec<(Device, Arc<ScriptedChecker>)>,
    transport: Arc<FakeTransport>,
    probe_workers: usize,
    healing_workers: usize,
) -> Harness {
    let mut credentials = StaticCredentials::new();
    credentials.insert(
        "lab-admin",
        Credentials {
            username: "admin".to_string(),
            ..Default::default()
        },
    );
    let healer = Arc::new(HealingExecutor::new(transport.clone(), Arc::new(credentials)));
    let store = StatusStore::new();
    let audit = Arc::new(AuditLog::in_memory(10_000));

    let settings = SchedulerSettings {
        probe_workers,
        healing_workers,
        control_channel: 4,
    };
    let scheduler = Scheduler::new(
        settings,
        CheckRunner::new(),
        healer,
        store.clone(),
        audit.clone(),
        None,
    );
    let monitored = devices
        .into_iter()
        .map(|(device, checker)| MonitoredDevice {
            device: Arc::new(device),
            checkers: vec![(checker as Arc<dyn HealthChecker>, Duration::from_millis(500))],
        })
        .collect();

    Harness {
        handle: scheduler.start(monitored),
        store,
        audit,
        transport,
    }
}

/// Poll the store until `device` reaches `phase`.
async fn wait_for_phase(store: &StatusStore, device: &str, phase: Phase) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.get(device).map(|s| s.phase).ok() == Some(phase) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never reached {:?}, last {:?}",
            device,
            phase,
            store.get(device).map(|s| s.phase).ok()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn healing_starts(audit: &AuditLog, device: &str) -> usize {
    audit
        .recent(10_000)
        .iter()
        .filter(|r| matches!(&r.event, AuditEvent::HealingStarted { device_id, .. } if device_id == device))
        .count()
}

#[tokio::test]
async fn test_initial_state_published_on_start() {
    let harness = start(
        vec![
            (device("lab1/pc-01", 3), Arc::new(ScriptedChecker::new(&[], true))),
            (device("lab1/pc-02", 3), Arc::new(ScriptedChecker::new(&[], true))),
        ],
        false,
        8,
    );

    assert_eq!(harness.store.len(), 2);
    assert_eq!(harness.store.get("lab1/pc-01").unwrap().phase, Phase::Healthy);
    assert_eq!(harness.handle.device_ids(), vec!["lab1/pc-01", "lab1/pc-02"]);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_threshold_heals_once_and_confirms_recovery() {
    let checker = Arc::new(ScriptedChecker::new(&[false, false, false], true));
    let harness = start(vec![(device("lab1/pc-01", 3), checker)], false, 8);

    // Wait until the attempt finished and a fresh check confirmed it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while healing_starts(&harness.audit, "lab1/pc-01") == 0
        || harness.store.get("lab1/pc-01").unwrap().phase != Phase::Healthy
    {
        assert!(tokio::time::Instant::now() < deadline, "device never recovered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = harness.store.get("lab1/pc-01").unwrap();
    assert_eq!(state.phase, Phase::Healthy);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.healing_attempts, 0);
    assert_eq!(state.last_healing.as_ref().map(|h| h.success), Some(true));
    assert_eq!(harness.transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(healing_starts(&harness.audit, "lab1/pc-01"), 1);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_attempts_need_manual_reset() {
    let checker = Arc::new(ScriptedChecker::new(&[], false));
    let harness = start(vec![(device("lab1/pc-01", 2), checker)], true, 8);

    wait_for_phase(&harness.store, "lab1/pc-01", Phase::ManualIntervention).await;
    // Checks keep failing, but no third attempt may start.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.transport.opens.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.store.get("lab1/pc-01").unwrap().phase,
        Phase::ManualIntervention
    );
    assert!(harness.audit.recent(10_000).iter().any(|r| matches!(
        &r.event,
        AuditEvent::ManualInterventionRequired { attempts: 2, .. }
    )));

    harness.handle.manual_reset("lab1/pc-01").await.unwrap();
    let reset = harness.audit.recent(10_000).into_iter().find(|r| {
        matches!(
            &r.event,
            AuditEvent::StateTransitioned {
                from: Phase::ManualIntervention,
                to: Phase::Healthy,
                ..
            }
        )
    });
    assert!(reset.is_some());

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_manual_reset_errors() {
    let harness = start(
        vec![(device("lab1/pc-01", 3), Arc::new(ScriptedChecker::new(&[], true)))],
        false,
        8,
    );

    assert!(matches!(
        harness.handle.manual_reset("lab1/pc-01").await,
        Err(CoreError::ResetNotApplicable { .. })
    ));
    assert!(matches!(
        harness.handle.manual_reset("lab9/nowhere").await,
        Err(CoreError::UnknownDevice(_))
    ));

    harness.handle.shutdown().await;
    assert!(matches!(
        harness.handle.manual_reset("lab1/pc-01").await,
        Err(CoreError::SchedulerStopped)
    ));
}

#[tokio::test]
async fn test_slow_probe_skips_ticks_instead_of_stacking() {
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let checker = Arc::new(ScriptedChecker::slow(
        Duration::from_millis(100),
        running,
        max_running.clone(),
    ));
    let harness = start(vec![(device("lab1/pc-01", 3), checker.clone())], false, 8);

    tokio::time::sleep(Duration::from_millis(350)).await;
    harness.handle.shutdown().await;

    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    let calls = checker.calls.load(Ordering::SeqCst);
    assert!((2..=5).contains(&calls), "unexpected probe count {}", calls);
}

#[tokio::test]
async fn test_probe_pool_bounds_concurrency_across_devices() {
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let devices = (0..4)
        .map(|n| {
            let checker = Arc::new(ScriptedChecker::slow(
                Duration::from_millis(30),
                running.clone(),
                max_running.clone(),
            ));
            (device(&format!("lab1/pc-{:02}", n), 3), checker)
        })
        .collect();
    let harness = start(devices, false, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.handle.shutdown().await;

    assert_eq!(max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_healing_pool_bounds_attempts_while_probes_continue() {
    let transport = Arc::new(FakeTransport {
        session_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let bystander = Arc::new(ScriptedChecker::new(&[], true));
    let devices = vec![
        (
            device("lab1/pc-01", 3),
            Arc::new(ScriptedChecker::new(&[false, false, false], true)),
        ),
        (
            device("lab1/pc-02", 3),
            Arc::new(ScriptedChecker::new(&[false, false, false], true)),
        ),
        (device("lab1/pc-03", 3), bystander.clone()),
    ];
    let harness = start_with(devices, transport.clone(), 8, 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let started = || {
        healing_starts(&harness.audit, "lab1/pc-01") + healing_starts(&harness.audit, "lab1/pc-02")
    };
    while started() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no attempt started");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let calls_at_first_start = bystander.calls.load(Ordering::SeqCst);
    while started() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "second attempt never ran");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // The second attempt waited out the first one's slow session.
    assert_eq!(transport.max_open_sessions.load(Ordering::SeqCst), 1);
    assert!(
        bystander.calls.load(Ordering::SeqCst) >= calls_at_first_start + 3,
        "healthy device stopped ticking during healing"
    );

    wait_for_phase(&harness.store, "lab1/pc-01", Phase::Healthy).await;
    wait_for_phase(&harness.store, "lab1/pc-02", Phase::Healthy).await;
    assert_eq!(transport.max_open_sessions.load(Ordering::SeqCst), 1);
    assert_eq!(transport.open_sessions.load(Ordering::SeqCst), 0);
    assert_eq!(harness.store.get("lab1/pc-03").unwrap().phase, Phase::Healthy);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_unhealable_device_caps_at_failing() {
    let mut unhealable = device("lab1/printer", 3);
    unhealable.unhealable = Some("healing enabled but no commands configured".to_string());
    let checker = Arc::new(ScriptedChecker::new(&[], false));
    let harness = start(vec![(unhealable, checker)], false, 8);

    wait_for_phase(&harness.store, "lab1/printer", Phase::Failing).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let state = harness.store.get("lab1/printer").unwrap();
    assert_eq!(state.phase, Phase::Failing);
    assert!(state.unhealable.is_some());
    assert_eq!(harness.transport.opens.load(Ordering::SeqCst), 0);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_probing() {
    let checker = Arc::new(ScriptedChecker::new(&[], true));
    let harness = start(vec![(device("lab1/pc-01", 3), checker.clone())], false, 8);

    tokio::time::sleep(Duration::from_millis(60)).await;
    harness.handle.shutdown().await;
    let after_shutdown = checker.calls.load(Ordering::SeqCst);
    assert!(after_shutdown >= 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(checker.calls.load(Ordering::SeqCst) <= after_shutdown + 1);
}
