mod probe;

pub use probe::{resolve_devices, HardwareInventory};

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of compute device a profile describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// NVIDIA GPU
    Cuda,
    /// Intel NPU
    Npu,
    /// AMD NPU through ROCm
    Hip,
    /// Apple Silicon GPU
    Mps,
    /// General-purpose processor
    Cpu,
}

impl DeviceKind {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }

    /// Presumed storage cost of one parameter on this kind.
    ///
    /// CUDA loads weights in half precision, everything else in full precision.
    pub fn default_bytes_per_param(&self) -> u32 {
        match self {
            DeviceKind::Cuda => 2,
            _ => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Npu => "npu",
            DeviceKind::Hip => "hip",
            DeviceKind::Mps => "mps",
            DeviceKind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two participating devices a tensor or module is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Primary,
    Secondary,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Primary => "primary",
            DeviceRole::Secondary => "secondary",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compute device participating in distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Primary or secondary slot
    pub role: DeviceRole,

    /// Hardware kind
    pub kind: DeviceKind,

    /// Fraction of work this device should receive, in (0, 1]
    pub weight: f64,

    /// Bytes per parameter used for size estimation
    pub bytes_per_param: u32,
}

impl DeviceProfile {
    /// Create a profile with the kind's default bytes-per-parameter.
    pub fn new(role: DeviceRole, kind: DeviceKind, weight: f64) -> Result<Self> {
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(EngineError::Config(format!(
                "{} device weight must be in (0, 1], got {}",
                role, weight
            )));
        }

        Ok(Self {
            role,
            kind,
            weight,
            bytes_per_param: kind.default_bytes_per_param(),
        })
    }

    pub fn with_bytes_per_param(mut self, bytes_per_param: u32) -> Self {
        self.bytes_per_param = bytes_per_param.max(1);
        self
    }

    /// Weight formatted the way health reports show it ("85%").
    pub fn weight_percent(&self) -> String {
        format!("{:.0}%", self.weight * 100.0)
    }
}

/// The resolved primary/secondary pair for one loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DevicePair {
    pub primary: DeviceProfile,
    pub secondary: DeviceProfile,
}

impl DevicePair {
    pub fn new(primary: DeviceProfile, secondary: DeviceProfile) -> Result<Self> {
        if primary.role != DeviceRole::Primary || secondary.role != DeviceRole::Secondary {
            return Err(EngineError::Config(format!(
                "device pair needs one primary and one secondary profile, got {} and {}",
                primary.role, secondary.role
            )));
        }
        Ok(Self { primary, secondary })
    }

    /// Both slots resolve to the same kind of hardware, so nothing is distributed.
    pub fn is_single_device(&self) -> bool {
        self.primary.kind == self.secondary.kind
    }

    pub fn profile(&self, role: DeviceRole) -> &DeviceProfile {
        match role {
            DeviceRole::Primary => &self.primary,
            DeviceRole::Secondary => &self.secondary,
        }
    }
}
