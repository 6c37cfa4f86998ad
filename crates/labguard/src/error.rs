//! Errors surfaced by the control core to its callers.

use crate::types::{DeviceId, Phase};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown device '{0}'")]
    UnknownDevice(DeviceId),

    #[error("device '{device}' is {phase}; manual reset only applies to manual_intervention")]
    ResetNotApplicable { device: DeviceId, phase: Phase },

    #[error("scheduler has stopped")]
    SchedulerStopped,
}
