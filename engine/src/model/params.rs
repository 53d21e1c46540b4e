use crate::device::DeviceRole;
use crate::errors::{EngineError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Placement record for one named parameter tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamInfo {
    pub numel: u64,
    pub device: DeviceRole,
}

/// How many parameters currently sit on each device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlacementSummary {
    pub primary_params: u64,
    pub secondary_params: u64,
}

impl PlacementSummary {
    /// The single device holding every parameter, if there is one.
    pub fn single_device(&self) -> Option<DeviceRole> {
        match (self.primary_params, self.secondary_params) {
            (_, 0) => Some(DeviceRole::Primary),
            (0, _) => Some(DeviceRole::Secondary),
            _ => None,
        }
    }
}

/// Named parameters of a model and the device each one lives on.
///
/// Names are dotted paths (`h.3.attn.c_attn.weight`). Every proper prefix of a
/// parameter name is a module (`h`, `h.3`, `h.3.attn`, `h.3.attn.c_attn`).
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    params: BTreeMap<String, ParamInfo>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, numel: u64, device: DeviceRole) {
        self.params.insert(name.into(), ParamInfo { numel, device });
    }

    /// Total parameter count across every tensor.
    pub fn parameter_count(&self) -> u64 {
        self.params.values().map(|p| p.numel).sum()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParamInfo> {
        self.params.get(name)
    }

    fn under<'a>(&'a self, module: &'a str) -> impl Iterator<Item = (&'a String, &'a ParamInfo)> + 'a {
        let prefix = format!("{}.", module);
        self.params
            .iter()
            .filter(move |(name, _)| name.as_str() == module || name.starts_with(&prefix))
    }

    /// Whether any parameter belongs to `module`.
    pub fn has_module(&self, module: &str) -> bool {
        self.under(module).next().is_some()
    }

    /// All module names derived from parameter paths, deduplicated.
    pub fn module_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut modules = Vec::new();

        for name in self.params.keys() {
            let parts: Vec<&str> = name.split('.').collect();
            for end in 1..parts.len() {
                let module = parts[..end].join(".");
                if seen.insert(module.clone()) {
                    modules.push(module);
                }
            }
        }

        modules
    }

    /// Device of `module` when all its parameters agree.
    pub fn device_of(&self, module: &str) -> Option<DeviceRole> {
        let mut devices = self.under(module).map(|(_, p)| p.device);
        let first = devices.next()?;
        devices.all(|d| d == first).then_some(first)
    }

    /// Move every parameter of `module` to `device`, returning how many tensors moved.
    ///
    /// A module without parameters is not relocatable.
    pub fn relocate(&mut self, module: &str, device: DeviceRole) -> Result<usize> {
        let prefix = format!("{}.", module);
        let mut moved = 0;

        for (name, info) in self.params.iter_mut() {
            if name.as_str() == module || name.starts_with(&prefix) {
                info.device = device;
                moved += 1;
            }
        }

        if moved == 0 {
            return Err(EngineError::Relocation {
                module: module.to_string(),
                reason: "module holds no parameters".to_string(),
            });
        }

        Ok(moved)
    }

    pub fn relocate_all(&mut self, device: DeviceRole) {
        for info in self.params.values_mut() {
            info.device = device;
        }
    }

    pub fn placement(&self) -> PlacementSummary {
        self.params
            .values()
            .fold(PlacementSummary::default(), |mut acc, p| {
                match p.device {
                    DeviceRole::Primary => acc.primary_params += p.numel,
                    DeviceRole::Secondary => acc.secondary_params += p.numel,
                }
                acc
            })
    }
}
