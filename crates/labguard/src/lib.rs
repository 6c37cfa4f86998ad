//! Labguard: lab fleet monitoring and self-healing core.
//!
//! # Architecture
//!
//! Each device is owned by one worker task that runs its checks on the
//! device's own cadence and feeds the results through a pure
//! [`DeviceStateMachine`]. The machine decides phase transitions and healing
//! dispatch; the worker applies the resulting effects:
//! - audit records go to the [`AuditLog`] before anything else,
//! - the new [`DeviceState`] is published to the [`StatusStore`],
//! - healing attempts run on a separate bounded pool via [`HealingExecutor`].
//!
//! # Components
//!
//! - **Scheduler**: per-device workers, probe pool and healing pool
//! - **DeviceStateMachine**: thresholds, single-flight healing, manual intervention
//! - **HealingExecutor**: ordered remote commands over one session
//! - **StatusStore**: copy-on-publish device states for observers
//! - **AuditLog**: durable JSON-lines journal, uptime and latency statistics

pub mod audit;
pub mod config;
pub mod device;
pub mod error;
pub mod healer;
pub mod http_server;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod state_machine;
pub mod status_store;
pub mod types;

pub use audit::{AuditError, AuditLog, AuditSink, JsonlSink, MemorySink, UptimeStats};
pub use config::{Config, ConfigError, DeviceRejection};
pub use device::{CheckSpec, CommandPolicy, Confirmation, Device, DeviceOs, HealingPlan};
pub use error::CoreError;
pub use healer::HealingExecutor;
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use scheduler::{MonitoredDevice, Scheduler, SchedulerHandle};
pub use server::LabguardServer;
pub use state_machine::{DeviceStateMachine, Effects};
pub use status_store::StatusStore;
pub use types::{AuditEvent, AuditRecord, DeviceId, DeviceState, HealingAttempt, Phase};
