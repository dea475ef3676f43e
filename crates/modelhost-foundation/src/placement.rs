//! Device placement: expanding configured device lists, resolving model
//! device preferences and remembering where each model wants to run.

use modelhost_backend::DeviceInventory;
use modelhost_kernel::{Device, DevicePreference, ErrorCode, ModelType, ServiceError, ServiceResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// Where a registered model should run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    pub model_type: ModelType,
    pub preference: DevicePreference,
    /// The device chosen when the model's workers were provisioned.
    pub device: Device,
}

#[derive(Debug, Default)]
pub struct AffinityMap {
    inner: RwLock<HashMap<String, Affinity>>,
}

impl AffinityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model_id: &str) -> Option<Affinity> {
        self.inner.read().get(model_id).cloned()
    }

    pub fn insert(&self, model_id: impl Into<String>, affinity: Affinity) {
        self.inner.write().insert(model_id.into(), affinity);
    }

    pub fn remove(&self, model_id: &str) -> Option<Affinity> {
        self.inner.write().remove(model_id)
    }

    pub fn snapshot(&self) -> HashMap<String, Affinity> {
        self.inner.read().clone()
    }
}

fn no_devices(message: impl Into<String>, details: serde_json::Value) -> ServiceError {
    ServiceError::new(ErrorCode::NoDevicesAvailable, message).with_details(details)
}

/// Expand configured device entries into concrete, available devices.
///
/// `auto` becomes every accelerator (or the CPU), `gpu`/`cuda` every
/// accelerator. Explicit devices missing from the inventory are skipped with
/// a warning. Order is preserved and duplicates removed.
pub fn expand_devices(
    specs: &[String],
    inventory: &DeviceInventory,
    require_gpu: bool,
) -> ServiceResult<Vec<Device>> {
    fn push(device: Device, devices: &mut Vec<Device>) {
        if !devices.contains(&device) {
            devices.push(device);
        }
    }

    let mut devices: Vec<Device> = Vec::new();

    for spec in specs {
        match spec.parse::<DevicePreference>()? {
            DevicePreference::Auto => {
                for device in inventory.devices() {
                    push(device, &mut devices);
                }
            }
            DevicePreference::Cpu => push(Device::Cpu, &mut devices),
            DevicePreference::Gpu => {
                if !inventory.has_accelerator() {
                    tracing::warn!(device = %spec, "No accelerator available for device entry");
                }
                for accel in &inventory.accelerators {
                    push(Device::Cuda(accel.index), &mut devices);
                }
            }
            DevicePreference::Explicit(device) => {
                if inventory.is_available(&device) {
                    push(device, &mut devices);
                } else {
                    tracing::warn!(%device, "Configured device is not available, skipping");
                }
            }
        }
    }

    if require_gpu && !devices.iter().any(Device::is_accelerator) {
        return Err(no_devices(
            "GPU required but no accelerator is available",
            json!({ "configured": specs, "require_gpu": true }),
        ));
    }
    if devices.is_empty() {
        return Err(no_devices(
            "none of the configured devices is available",
            json!({ "configured": specs }),
        ));
    }
    Ok(devices)
}

/// Resolve a model's device preference on a worker.
///
/// - explicit devices are used verbatim
/// - `cpu` forces the CPU
/// - `auto` takes the worker's device, else the first accelerator, else CPU
/// - `gpu` takes the worker's device if it is an accelerator, else the first
///   accelerator; without one it degrades to CPU unless `require_gpu`
pub fn resolve_device(
    preference: DevicePreference,
    worker_device: Option<Device>,
    inventory: &DeviceInventory,
    require_gpu: bool,
) -> ServiceResult<Device> {
    match preference {
        DevicePreference::Explicit(device) => Ok(device),
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Auto => Ok(worker_device
            .or_else(|| inventory.first_accelerator())
            .unwrap_or(Device::Cpu)),
        DevicePreference::Gpu => {
            if let Some(device) = worker_device.filter(Device::is_accelerator) {
                return Ok(device);
            }
            if let Some(device) = inventory.first_accelerator() {
                return Ok(device);
            }
            if require_gpu {
                return Err(no_devices(
                    "GPU requested but no accelerator is available",
                    json!({ "preference": "gpu", "require_gpu": true }),
                ));
            }
            tracing::warn!("GPU requested but no accelerator is available, falling back to CPU");
            Ok(Device::Cpu)
        }
    }
}
