//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Shared device roster read by the engine and mutated by collaborators."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::sync::Arc;

use devsim_common::AppConfig;
use devsim_sim::{Device, DeviceStatus, MetricConfig};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Partial device update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<DeviceStatus>,
    #[serde(default)]
    pub current_scenario: Option<String>,
    #[serde(default)]
    pub metrics: Option<Vec<MetricConfig>>,
}

impl DevicePatch {
    pub fn status(status: DeviceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn scenario(scenario: impl Into<String>) -> Self {
        Self {
            current_scenario: Some(scenario.into()),
            ..Self::default()
        }
    }

    fn apply(self, device: &mut Device) {
        if let Some(name) = self.name {
            device.name = name;
        }
        if let Some(description) = self.description {
            device.description = Some(description);
        }
        if let Some(status) = self.status {
            device.status = status;
        }
        if let Some(scenario) = self.current_scenario {
            device.current_scenario = scenario;
        }
        if let Some(metrics) = self.metrics {
            device.metrics = metrics;
        }
    }
}

/// Cheaply cloneable handle to the device roster. The engine reads a snapshot
/// every tick, so changes take effect on the next tick.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<IndexMap<String, Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let registry = Self::new();
        registry.replace_all(devices);
        registry
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::from_devices(
            config
                .devices
                .iter()
                .map(|(id, device)| Device::from_config(id, device)),
        )
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    pub fn first_id(&self) -> Option<String> {
        self.devices.read().keys().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Replace the roster, keeping the order of `devices`.
    pub fn replace_all(&self, devices: impl IntoIterator<Item = Device>) {
        let roster: IndexMap<String, Device> = devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect();
        debug!(devices = roster.len(), "device roster replaced");
        *self.devices.write() = roster;
    }

    pub fn upsert(&self, device: Device) {
        self.devices.write().insert(device.id.clone(), device);
    }

    pub fn remove(&self, id: &str) -> Option<Device> {
        self.devices.write().shift_remove(id)
    }

    pub fn update_device_status(&self, id: &str, status: DeviceStatus) -> Option<Device> {
        self.update_device(id, DevicePatch::status(status))
    }

    /// Mark every device as running. Returns how many changed state.
    pub fn start_system(&self) -> usize {
        let mut devices = self.devices.write();
        let mut started = 0;
        for device in devices.values_mut().filter(|device| !device.is_running()) {
            device.status = DeviceStatus::Running;
            started += 1;
        }
        info!(started, "system start requested");
        started
    }

    pub fn update_device(&self, id: &str, patch: DevicePatch) -> Option<Device> {
        let mut devices = self.devices.write();
        let device = devices.get_mut(id)?;
        patch.apply(device);
        debug!(device = id, status = %device.status, scenario = %device.current_scenario, "device updated");
        Some(device.clone())
    }
}
