//! Per-device check cadence, bounded probe and healing pools.
//!
//! Every device gets one worker task that exclusively owns its
//! [`DeviceStateMachine`]. Probe rounds and healing attempts run as spawned
//! tasks gated by two separate semaphores and report back to the owning
//! worker over channels, so no state is shared between devices beyond the
//! [`StatusStore`] and the [`AuditLog`].

use crate::audit::AuditLog;
use crate::config::SchedulerSettings;
use crate::device::Device;
use crate::error::CoreError;
use crate::healer::HealingExecutor;
use crate::metrics::MetricsRegistry;
use crate::state_machine::{DeviceStateMachine, Effects, HealingDispatch};
use crate::status_store::StatusStore;
use crate::types::{DeviceId, HealingAttempt};
use chrono::Utc;
use healthcheck::{CheckError, CheckResult, CheckRunner, HealthChecker};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

/// A device ready to be scheduled: its definition and built probes.
pub struct MonitoredDevice {
    pub device: Arc<Device>,
    pub checkers: Vec<(Arc<dyn HealthChecker>, Duration)>,
}

enum Control {
    ManualReset(oneshot::Sender<Result<(), CoreError>>),
}

enum HealingMsg {
    Started,
    Finished(HealingAttempt),
}

/// Collaborators shared by every device worker.
struct Shared {
    runner: CheckRunner,
    healer: Arc<HealingExecutor>,
    store: StatusStore,
    audit: Arc<AuditLog>,
    metrics: Option<Arc<MetricsRegistry>>,
    probe_pool: Arc<Semaphore>,
    healing_pool: Arc<Semaphore>,
}

/// Starts the device workers.
pub struct Scheduler {
    settings: SchedulerSettings,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        runner: CheckRunner,
        healer: Arc<HealingExecutor>,
        store: StatusStore,
        audit: Arc<AuditLog>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let shared = Shared {
            runner,
            healer,
            store,
            audit,
            metrics,
            probe_pool: Arc::new(Semaphore::new(settings.probe_workers)),
            healing_pool: Arc::new(Semaphore::new(settings.healing_workers)),
        };
        Self {
            settings,
            shared: Arc::new(shared),
        }
    }

    /// Spawn one worker per device. Each worker publishes its initial state
    /// before the first probe runs.
    pub fn start(self, devices: Vec<MonitoredDevice>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut controls = HashMap::with_capacity(devices.len());
        let mut workers = Vec::with_capacity(devices.len());

        info!(
            devices = devices.len(),
            probe_workers = self.settings.probe_workers,
            healing_workers = self.settings.healing_workers,
            "Starting scheduler"
        );

        for monitored in devices {
            let (control_tx, control_rx) = mpsc::channel(self.settings.control_channel);
            let id = monitored.device.id.clone();
            let worker = DeviceWorker {
                machine: DeviceStateMachine::new(monitored.device),
                checkers: Arc::new(monitored.checkers),
                shared: self.shared.clone(),
            };
            // Publish before spawning so the store is complete once start returns.
            worker.publish();
            workers.push(tokio::spawn(worker.run(control_rx, shutdown_rx.clone())));
            controls.insert(id, control_tx);
        }

        SchedulerHandle {
            controls: Arc::new(controls),
            shutdown: Arc::new(shutdown_tx),
            workers: Arc::new(Mutex::new(workers)),
        }
    }
}

/// Control surface of a running scheduler. Dropping every handle stops it.
#[derive(Clone)]
pub struct SchedulerHandle {
    controls: Arc<HashMap<DeviceId, mpsc::Sender<Control>>>,
    shutdown: Arc<watch::Sender<bool>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Clear `ManualIntervention` for one device.
    pub async fn manual_reset(&self, device_id: &str) -> Result<(), CoreError> {
        let control = self
            .controls
            .get(device_id)
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        control
            .send(Control::ManualReset(reply_tx))
            .await
            .map_err(|_| CoreError::SchedulerStopped)?;
        reply_rx.await.map_err(|_| CoreError::SchedulerStopped)?
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.controls.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every worker and wait for them to exit. In-flight healing
    /// attempts are left to finish on their own.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Device worker ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}

type RoundResults = Vec<Result<CheckResult, CheckError>>;

struct DeviceWorker {
    machine: DeviceStateMachine,
    checkers: Arc<Vec<(Arc<dyn HealthChecker>, Duration)>>,
    shared: Arc<Shared>,
}

impl DeviceWorker {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<Control>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let device = self.machine.device().clone();
        let mut ticker = interval(device.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // One round outstanding at most, so capacity 1 never blocks.
        let (round_tx, mut round_rx) = mpsc::channel::<RoundResults>(1);
        let (healing_tx, mut healing_rx) = mpsc::channel::<HealingMsg>(2);
        let mut round_outstanding = false;

        debug!(device = %device.id, interval = ?device.interval, "Device worker started");

        loop {
            let rearm = self.rearm_delay();

            tokio::select! {
                _ = shutdown_rx.changed() => break,

                _ = ticker.tick() => {
                    if round_outstanding {
                        debug!(device = %device.id, "Previous probe round still running, skipping tick");
                        if let Some(metrics) = &self.shared.metrics {
                            metrics.record_tick_skipped();
                        }
                    } else {
                        round_outstanding = self.start_round(&round_tx);
                    }
                }

                Some(results) = round_rx.recv() => {
                    round_outstanding = false;
                    for result in results {
                        self.handle_result(result, &healing_tx).await;
                    }
                }

                Some(msg) = healing_rx.recv() => {
                    let fx = match msg {
                        HealingMsg::Started => self.machine.healing_started(),
                        HealingMsg::Finished(attempt) => {
                            if let Some(metrics) = &self.shared.metrics {
                                let took = (attempt.finished_at - attempt.started_at)
                                    .to_std()
                                    .unwrap_or_default();
                                metrics.record_healing(&device.id, attempt.success, took);
                            }
                            self.machine.apply_healing_outcome(&attempt)
                        }
                    };
                    self.apply(fx, &healing_tx).await;
                }

                Some(control) = control_rx.recv() => match control {
                    Control::ManualReset(reply) => {
                        let outcome = match self.machine.manual_reset() {
                            Ok(fx) => {
                                info!(device = %device.id, "Manual reset applied");
                                self.apply(fx, &healing_tx).await;
                                Ok(())
                            }
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(outcome);
                    }
                },

                _ = sleep(rearm.unwrap_or_default()), if rearm.is_some() => {
                    let fx = self.machine.rearm(Utc::now());
                    self.apply(fx, &healing_tx).await;
                }
            }
        }

        if self.machine.state().healing_in_flight {
            warn!(device = %device.id, "Stopping with a healing attempt in flight");
        }
        debug!(device = %device.id, "Device worker stopped");
    }

    /// Time until the cooldown re-arm is due.
    fn rearm_delay(&self) -> Option<Duration> {
        self.machine
            .next_rearm()
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Start a probe round if the probe pool has room. A saturated pool
    /// defers the round to the next tick.
    fn start_round(&self, round_tx: &mpsc::Sender<RoundResults>) -> bool {
        let device_id = self.machine.device().id.clone();
        let permit = match self.shared.probe_pool.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(device = %device_id, "Probe pool saturated, deferring to next tick");
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_deferred();
                }
                return false;
            }
        };

        let shared = self.shared.clone();
        let checkers = self.checkers.clone();
        let round_tx = round_tx.clone();
        tokio::spawn(async move {
            let results = shared.runner.run_all(&device_id, &checkers).await;
            drop(permit);
            let _ = round_tx.send(results).await;
        });
        true
    }

    async fn handle_result(
        &mut self,
        result: Result<CheckResult, CheckError>,
        healing_tx: &mpsc::Sender<HealingMsg>,
    ) {
        let device_id = &self.machine.device().id;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                error!(device = %device_id, error = %e, "Check could not run");
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_error("checker");
                }
                return;
            }
        };

        if result.success {
            debug!(device = %device_id, kind = %result.kind, latency_ms = ?result.latency_ms(), "Check succeeded");
        } else {
            warn!(
                device = %device_id,
                kind = %result.kind,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Check failed"
            );
        }
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_check(device_id, result.kind.label(), result.success, result.latency);
        }

        let fx = self.machine.apply_check(&result);
        self.apply(fx, healing_tx).await;
    }

    /// Audit first, then publish, then dispatch.
    async fn apply(&mut self, fx: Effects, healing_tx: &mpsc::Sender<HealingMsg>) {
        let device_id = self.machine.device().id.clone();
        for event in &fx.events {
            if let Err(e) = self.shared.audit.append(event.clone()).await {
                error!(device = %device_id, event = event.name(), error = %e, "Failed to append audit record");
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_error("audit_append");
                }
            }
        }
        if let Some(metrics) = &self.shared.metrics {
            for transition in &fx.transitions {
                metrics.record_transition(&device_id, transition.from, transition.to);
            }
        }
        if fx.changes_state() {
            self.publish();
        }
        if let Some(dispatch) = fx.dispatch {
            self.spawn_healing(dispatch, healing_tx.clone());
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        if let Some(metrics) = &self.shared.metrics {
            metrics.update_device(&state.device_id, state.phase, state.consecutive_failures);
        }
        self.shared.store.publish(state.clone());
    }

    /// Queue the attempt on the healing pool. The worker hears back when it
    /// starts and when it finishes.
    fn spawn_healing(&self, dispatch: HealingDispatch, healing_tx: mpsc::Sender<HealingMsg>) {
        let device = self.machine.device().clone();
        let pool = self.shared.healing_pool.clone();
        let healer = self.shared.healer.clone();
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            if healing_tx.send(HealingMsg::Started).await.is_err() {
                return;
            }
            let attempt = healer.heal(&device, dispatch.attempt).await;
            let _ = healing_tx.send(HealingMsg::Finished(attempt)).await;
        });
    }
}
