//! Device inventory for worker placement.
//!
//! Accelerators are discovered through filesystem probes and `nvidia-smi`
//! rather than by linking GPU libraries, so the crate builds everywhere.

use modelhost_kernel::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// One CUDA device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accelerator {
    pub index: u32,
    /// Total VRAM in bytes, 0 when unknown.
    pub vram_bytes: u64,
}

/// Compute devices and memory available to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInventory {
    pub accelerators: Vec<Accelerator>,
    pub total_ram_bytes: u64,
    pub available_ram_bytes: u64,
    pub cpu_cores: usize,
}

impl DeviceInventory {
    /// Probe the host.
    ///
    /// Runs synchronously; call from a blocking context or `spawn_blocking`.
    pub fn detect() -> Self {
        let accelerators = detect_cuda();

        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let inventory = Self {
            accelerators,
            total_ram_bytes: sys.total_memory(),
            available_ram_bytes: sys.available_memory(),
            cpu_cores: num_cpus(),
        };
        tracing::info!(
            accelerators = inventory.accelerators.len(),
            total_ram_mb = inventory.total_ram_bytes / (1024 * 1024),
            cpu_cores = inventory.cpu_cores,
            "Detected device inventory"
        );
        inventory
    }

    /// A host with no accelerators.
    pub fn cpu_only() -> Self {
        Self {
            accelerators: Vec::new(),
            total_ram_bytes: 0,
            available_ram_bytes: 0,
            cpu_cores: num_cpus(),
        }
    }

    /// A host with `count` accelerators of unknown size, `cuda:0..count`.
    pub fn with_accelerators(count: u32) -> Self {
        Self {
            accelerators: (0..count)
                .map(|index| Accelerator {
                    index,
                    vram_bytes: 0,
                })
                .collect(),
            ..Self::cpu_only()
        }
    }

    pub fn has_accelerator(&self) -> bool {
        !self.accelerators.is_empty()
    }

    pub fn is_available(&self, device: &Device) -> bool {
        match device {
            Device::Cpu => true,
            Device::Cuda(index) => self.accelerators.iter().any(|a| a.index == *index),
        }
    }

    pub fn first_accelerator(&self) -> Option<Device> {
        self.accelerators.first().map(|a| Device::Cuda(a.index))
    }

    /// Every accelerator, or just the CPU when there are none.
    pub fn devices(&self) -> Vec<Device> {
        if self.accelerators.is_empty() {
            vec![Device::Cpu]
        } else {
            self.accelerators
                .iter()
                .map(|a| Device::Cuda(a.index))
                .collect()
        }
    }
}

/// Returns the CUDA devices on this host.
///
/// 1. `/dev/nvidia0` must exist (kernel module loaded)
/// 2. `nvidia-smi --query-gpu=index,memory.total` lists index and MiB per device
///
/// If the device node exists but `nvidia-smi` fails, a single device of
/// unknown size is reported.
fn detect_cuda() -> Vec<Accelerator> {
    if !Path::new("/dev/nvidia0").exists() {
        return Vec::new();
    }

    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let parsed = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
            if parsed.is_empty() {
                vec![Accelerator {
                    index: 0,
                    vram_bytes: 0,
                }]
            } else {
                parsed
            }
        }
        _ => vec![Accelerator {
            index: 0,
            vram_bytes: 0,
        }],
    }
}

fn parse_nvidia_smi(stdout: &str) -> Vec<Accelerator> {
    stdout
        .lines()
        .filter_map(|line| {
            let (index, mib) = line.split_once(',')?;
            let index = index.trim().parse().ok()?;
            let mib: u64 = mib.trim().parse().ok()?;
            Some(Accelerator {
                index,
                vram_bytes: mib * 1024 * 1024,
            })
        })
        .collect()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_rows() {
        let rows = parse_nvidia_smi("0, 24576\n1, 81920\nbogus\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].index, 0);
        assert_eq!(rows[1].vram_bytes, 81920 * 1024 * 1024);
    }

    #[test]
    fn cpu_only_inventory() {
        let inv = DeviceInventory::cpu_only();
        assert!(!inv.has_accelerator());
        assert!(inv.is_available(&Device::Cpu));
        assert!(!inv.is_available(&Device::Cuda(0)));
        assert_eq!(inv.devices(), vec![Device::Cpu]);
        assert!(inv.cpu_cores >= 1);
    }

    #[test]
    fn synthetic_accelerators() {
        let inv = DeviceInventory::with_accelerators(2);
        assert!(inv.is_available(&Device::Cuda(1)));
        assert!(!inv.is_available(&Device::Cuda(2)));
        assert_eq!(inv.first_accelerator(), Some(Device::Cuda(0)));
        assert_eq!(inv.devices(), vec![Device::Cuda(0), Device::Cuda(1)]);
    }

    #[test]
    fn detect_does_not_panic() {
        let inv = DeviceInventory::detect();
        assert!(inv.cpu_cores >= 1);
    }
}
