//! Main labguard server implementation.

use crate::audit::{AuditLog, JsonlSink};
use crate::config::{Config, DeviceLoad, DeviceRejection};
use crate::healer::HealingExecutor;
use crate::http_server::MetricsServer;
use crate::metrics::MetricsRegistry;
use crate::scheduler::{MonitoredDevice, Scheduler};
use crate::status_store::StatusStore;
use healthcheck::{CheckRunner, CredentialResolver, OpenSshTransport, RemoteTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

/// Labguard server
pub struct LabguardServer {
    config: Config,
}

impl LabguardServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> common::Result<()> {
        info!("Starting labguard server");
        let config = self.config;

        let metrics = if config.metrics.enabled {
            info!("Metrics enabled on {}", config.metrics.listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let resolver: Arc<dyn CredentialResolver> = Arc::new(config.credential_resolver());
        let transport: Arc<dyn RemoteTransport> = Arc::new(OpenSshTransport::default());

        let (monitored, rejected) = monitor_devices(config.load_devices(), &transport, &resolver);
        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "Some device entries were rejected");
        }
        if monitored.is_empty() {
            warn!("No devices to monitor");
        }
        if let Some(metrics) = &metrics {
            metrics.set_device_count(monitored.len(), rejected.len());
        }

        let sink = Arc::new(JsonlSink::open(&config.audit.path, config.audit.sync).await?);
        let audit = Arc::new(AuditLog::open(sink, config.audit.history_capacity).await?);
        let store = StatusStore::new();
        let healer = Arc::new(HealingExecutor::new(transport, resolver));

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            CheckRunner::new(),
            healer,
            store.clone(),
            audit.clone(),
            metrics.clone(),
        );
        let metrics_server = match metrics {
            Some(registry) => {
                let server =
                    MetricsServer::new(registry, store.clone(), config.metrics.listen_addr.clone());
                let listener = server.bind().await?;
                Some((server, listener))
            }
            None => None,
        };

        let handle = scheduler.start(monitored);

        let metrics_handle = metrics_server.map(|(server, listener)| {
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!(error = %e, "Metrics server failed");
                }
            })
        });

        let retention_handle = tokio::spawn(retention_task(
            audit.clone(),
            config.audit.retention,
            config.audit.prune_interval,
        ));

        info!(devices = handle.device_ids().len(), "Labguard running");

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }

        handle.shutdown().await;
        retention_handle.abort();
        if let Some(metrics_handle) = metrics_handle {
            metrics_handle.abort();
        }

        info!("Labguard stopped");
        Ok(())
    }
}

/// Build the probes of every loaded device. A device whose probes cannot be
/// built joins the rejections.
pub fn monitor_devices(
    load: DeviceLoad,
    transport: &Arc<dyn RemoteTransport>,
    resolver: &Arc<dyn CredentialResolver>,
) -> (Vec<MonitoredDevice>, Vec<DeviceRejection>) {
    let DeviceLoad {
        devices,
        mut rejected,
    } = load;
    let mut monitored = Vec::with_capacity(devices.len());

    for device in devices {
        match device.build_checkers(transport, resolver) {
            Ok(checkers) => monitored.push(MonitoredDevice {
                device: Arc::new(device),
                checkers,
            }),
            Err(e) => {
                let rejection = DeviceRejection {
                    lab: device.lab_id.clone(),
                    entry: device.id.clone(),
                    reason: e.to_string(),
                };
                warn!(rejection = %rejection, "Device entry rejected");
                rejected.push(rejection);
            }
        }
    }
    (monitored, rejected)
}

async fn retention_task(audit: Arc<AuditLog>, retention: Duration, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match audit.prune_retention(retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Pruned expired audit records"),
            Err(e) => error!(error = %e, "Audit pruning failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthcheck::StaticCredentials;

    #[test]
    fn test_monitor_devices_rejects_unbuildable() {
        let yaml = r#"
labs:
  lab1:
    devices:
      - address: 10.0.0.1
      - address: 10.0.0.2
        checks:
          http:
            url: "http://[::1"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let load = config.load_devices();
        assert_eq!(load.devices.len(), 2);

        let transport: Arc<dyn RemoteTransport> = Arc::new(OpenSshTransport::default());
        let resolver: Arc<dyn CredentialResolver> = Arc::new(StaticCredentials::new());
        let (monitored, rejected) = monitor_devices(load, &transport, &resolver);

        assert_eq!(monitored.len(), 1);
        assert_eq!(monitored[0].device.id, "lab1/10.0.0.1");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].entry, "lab1/10.0.0.2");
    }

    #[test]
    fn test_server_creation() {
        let server = LabguardServer::new(Config::default());
        assert!(server.config.labs.is_empty());
    }
}
