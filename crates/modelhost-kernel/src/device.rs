//! Compute device identifiers and device preferences.

use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A concrete compute target.
///
/// Parses from exactly `"cpu"` or `"cuda:N"` where `N` is a non-negative
/// integer. Anything else is rejected with `INVALID_DEVICE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = ServiceError;

    fn from_str(s: &str) -> ServiceResult<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Cpu);
        }
        if let Some(index) = trimmed.strip_prefix("cuda:") {
            // u32 parsing rejects signs, blanks and fractional indices
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(index) = index.parse::<u32>() {
                    return Ok(Device::Cuda(index));
                }
            }
        }
        Err(ServiceError::invalid_device(s))
    }
}

impl TryFrom<String> for Device {
    type Error = ServiceError;

    fn try_from(value: String) -> ServiceResult<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Where a model would like to run.
///
/// - `auto`: the worker's own device, else the first accelerator, else CPU
/// - `cpu`: always CPU
/// - `gpu` / `cuda`: any accelerator
/// - `cuda:N`: that exact device, used verbatim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Gpu,
    Explicit(Device),
}

impl DevicePreference {
    /// The explicit device this preference pins, if any.
    pub fn explicit(&self) -> Option<Device> {
        match self {
            DevicePreference::Explicit(device) => Some(*device),
            DevicePreference::Cpu => Some(Device::Cpu),
            _ => None,
        }
    }

    /// Whether a worker on `device` satisfies this preference.
    pub fn matches(&self, device: Device) -> bool {
        match self {
            DevicePreference::Auto => true,
            DevicePreference::Cpu => device == Device::Cpu,
            DevicePreference::Gpu => device.is_accelerator(),
            DevicePreference::Explicit(wanted) => *wanted == device,
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Auto => write!(f, "auto"),
            DevicePreference::Cpu => write!(f, "cpu"),
            DevicePreference::Gpu => write!(f, "gpu"),
            DevicePreference::Explicit(device) => write!(f, "{device}"),
        }
    }
}

impl FromStr for DevicePreference {
    type Err = ServiceError;

    fn from_str(s: &str) -> ServiceResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "gpu" | "cuda" => Ok(DevicePreference::Gpu),
            _ => s.parse::<Device>().map(DevicePreference::Explicit),
        }
    }
}

impl TryFrom<String> for DevicePreference {
    type Error = ServiceError;

    fn try_from(value: String) -> ServiceResult<Self> {
        value.parse()
    }
}

impl From<DevicePreference> for String {
    fn from(pref: DevicePreference) -> Self {
        pref.to_string()
    }
}
