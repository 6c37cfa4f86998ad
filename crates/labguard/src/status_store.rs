//! Published device states, readable by observers.

use crate::error::CoreError;
use crate::types::{DeviceId, DeviceState, Phase};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Concurrent map of the latest published state per device.
///
/// Every publish swaps in a whole new `Arc<DeviceState>`, so readers never
/// observe a half-updated record and never hold a lock while they look at
/// one.
#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    states: Arc<DashMap<DeviceId, Arc<DeviceState>>>,
}

/// Per-phase device counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounts {
    pub total: usize,
    pub by_phase: BTreeMap<&'static str, usize>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published state of one device.
    pub fn publish(&self, state: DeviceState) {
        self.states
            .insert(state.device_id.clone(), Arc::new(state));
    }

    pub fn get(&self, device_id: &str) -> Result<Arc<DeviceState>, CoreError> {
        self.states
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))
    }

    /// Point-in-time copy of every published state.
    pub fn snapshot(&self) -> HashMap<DeviceId, Arc<DeviceState>> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Published states of one lab, ordered by device id.
    pub fn snapshot_lab(&self, lab_id: &str) -> Vec<Arc<DeviceState>> {
        let mut states: Vec<Arc<DeviceState>> = self
            .states
            .iter()
            .filter(|entry| entry.value().lab_id == lab_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    pub fn phase_counts(&self) -> PhaseCounts {
        let mut counts = PhaseCounts::default();
        for phase in Phase::ALL {
            counts.by_phase.insert(phase.as_str(), 0);
        }
        for entry in self.states.iter() {
            counts.total += 1;
            *counts
                .by_phase
                .entry(entry.value().phase.as_str())
                .or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
