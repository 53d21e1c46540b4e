use super::{DeviceKind, DevicePair, DeviceProfile, DeviceRole};
use crate::config::DeviceSettings;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

/// What the host offers, as seen by the probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInventory {
    /// NVIDIA driver present
    pub cuda: bool,

    /// Apple Silicon GPU present
    pub mps: bool,

    /// Intel NPU enabled (`USE_INTEL_NPU`)
    pub intel_npu: bool,

    /// AMD NPU enabled (`USE_AMD_NPU`) and ROCm runtime present
    pub amd_npu: bool,

    /// Number of CPU cores
    pub cpu_cores: usize,

    /// Total RAM in megabytes
    pub ram_mb: usize,

    /// Operating system
    pub os: String,

    /// CPU architecture
    pub arch: String,
}

impl HardwareInventory {
    /// Probe the current host.
    ///
    /// NPUs are opt-in through environment flags, matching how the vendor
    /// runtimes are enabled in practice.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let cpu_cores = sys.cpus().len();
        let ram_mb = (sys.total_memory() / 1_048_576) as usize;

        let cuda = Self::detect_cuda();
        let mps = cfg!(all(target_os = "macos", target_arch = "aarch64"));

        let intel_npu = env_flag("USE_INTEL_NPU");
        if !intel_npu {
            tracing::info!("Intel NPU detection skipped - set USE_INTEL_NPU=1 to enable");
        }

        let amd_npu = if env_flag("USE_AMD_NPU") {
            let rocm = Path::new("/dev/kfd").exists();
            if !rocm {
                tracing::info!("AMD NPU requested but ROCm runtime not available");
            }
            rocm
        } else {
            tracing::info!("AMD NPU detection skipped - set USE_AMD_NPU=1 to enable");
            false
        };

        let inventory = Self {
            cuda,
            mps,
            intel_npu,
            amd_npu,
            cpu_cores,
            ram_mb,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        };

        tracing::info!(
            cuda = inventory.cuda,
            mps = inventory.mps,
            intel_npu = inventory.intel_npu,
            amd_npu = inventory.amd_npu,
            cpu_cores = inventory.cpu_cores,
            ram_mb = inventory.ram_mb,
            "Hardware probed"
        );

        inventory
    }

    fn detect_cuda() -> bool {
        Path::new("/proc/driver/nvidia/version").exists() || Path::new("/dev/nvidia0").exists()
    }

    /// Pick (primary, secondary) kinds.
    ///
    /// Priority: Intel NPU > AMD NPU > CUDA > MPS > CPU. The secondary is CUDA
    /// when an NPU leads and a GPU exists, otherwise the CPU.
    pub fn select_kinds(&self) -> (DeviceKind, DeviceKind) {
        match self {
            Self { intel_npu: true, cuda: true, .. } => (DeviceKind::Npu, DeviceKind::Cuda),
            Self { intel_npu: true, .. } => (DeviceKind::Npu, DeviceKind::Cpu),
            Self { amd_npu: true, cuda: true, .. } => (DeviceKind::Hip, DeviceKind::Cuda),
            Self { amd_npu: true, .. } => (DeviceKind::Hip, DeviceKind::Cpu),
            Self { cuda: true, .. } => (DeviceKind::Cuda, DeviceKind::Cpu),
            Self { mps: true, .. } => (DeviceKind::Mps, DeviceKind::Cpu),
            _ => (DeviceKind::Cpu, DeviceKind::Cpu),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Turn a probed inventory plus settings into the device pair for a load.
///
/// Forced kinds in the settings win over the probe.
pub fn resolve_devices(inventory: &HardwareInventory, settings: &DeviceSettings) -> Result<DevicePair> {
    let (probed_primary, probed_secondary) = inventory.select_kinds();
    let primary_kind = settings.primary.unwrap_or(probed_primary);
    let secondary_kind = settings.secondary.unwrap_or(probed_secondary);

    let mut primary = DeviceProfile::new(DeviceRole::Primary, primary_kind, settings.primary_weight)?;
    let mut secondary =
        DeviceProfile::new(DeviceRole::Secondary, secondary_kind, settings.secondary_weight)?;

    if let Some(bytes) = settings.bytes_per_param {
        primary = primary.with_bytes_per_param(bytes);
        secondary = secondary.with_bytes_per_param(bytes);
    }

    let pair = DevicePair::new(primary, secondary)?;

    if pair.is_single_device() {
        tracing::info!(device = %primary_kind, "Using a single device for inference");
    } else {
        tracing::info!(
            primary = %primary_kind,
            primary_weight = %primary.weight_percent(),
            secondary = %secondary_kind,
            secondary_weight = %secondary.weight_percent(),
            "Resolved inference devices"
        );
    }

    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> HardwareInventory {
        HardwareInventory {
            cpu_cores: 8,
            ram_mb: 16_384,
            ..Default::default()
        }
    }

    #[test]
    fn test_priority_table() {
        let cases = [
            ((true, false, true, false), (DeviceKind::Npu, DeviceKind::Cuda)),
            ((true, false, false, false), (DeviceKind::Npu, DeviceKind::Cpu)),
            ((false, true, true, false), (DeviceKind::Hip, DeviceKind::Cuda)),
            ((false, true, false, true), (DeviceKind::Hip, DeviceKind::Cpu)),
            ((false, false, true, true), (DeviceKind::Cuda, DeviceKind::Cpu)),
            ((false, false, false, true), (DeviceKind::Mps, DeviceKind::Cpu)),
            ((false, false, false, false), (DeviceKind::Cpu, DeviceKind::Cpu)),
        ];

        for ((intel_npu, amd_npu, cuda, mps), expected) in cases {
            let inv = HardwareInventory {
                intel_npu,
                amd_npu,
                cuda,
                mps,
                ..inventory()
            };
            assert_eq!(inv.select_kinds(), expected, "inventory {:?}", inv);
        }
    }

    #[test]
    fn test_resolve_uses_reference_weights() {
        let inv = HardwareInventory {
            cuda: true,
            ..inventory()
        };
        let pair = resolve_devices(&inv, &DeviceSettings::default()).unwrap();

        assert_eq!(pair.primary.kind, DeviceKind::Cuda);
        assert_eq!(pair.primary.weight, 0.85);
        assert_eq!(pair.primary.bytes_per_param, 2);
        assert_eq!(pair.secondary.kind, DeviceKind::Cpu);
        assert_eq!(pair.secondary.weight, 0.15);
        assert!(!pair.is_single_device());
    }

    #[test]
    fn test_forced_kinds_override_probe() {
        let settings = DeviceSettings {
            primary: Some(DeviceKind::Cuda),
            secondary: Some(DeviceKind::Cuda),
            bytes_per_param: Some(4),
            ..Default::default()
        };
        let pair = resolve_devices(&inventory(), &settings).unwrap();

        assert_eq!(pair.primary.kind, DeviceKind::Cuda);
        assert_eq!(pair.secondary.kind, DeviceKind::Cuda);
        assert_eq!(pair.primary.bytes_per_param, 4);
        assert!(pair.is_single_device());
    }

    #[test]
    fn test_cpu_only_host_is_single_device() {
        let pair = resolve_devices(&inventory(), &DeviceSettings::default()).unwrap();
        assert!(pair.is_single_device());
        assert_eq!(pair.primary.kind, DeviceKind::Cpu);
    }
}
