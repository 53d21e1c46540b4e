use super::StrategyKind;
use crate::config::PolicySettings;
use crate::device::DeviceKind;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Approximate footprint in GB: `parameter_count * bytes_per_param / 1024^3`.
///
/// Only a heuristic for strategy selection; nothing enforces it.
pub fn estimate_size_gb(parameter_count: u64, bytes_per_param: u32) -> f64 {
    parameter_count as f64 * bytes_per_param as f64 / BYTES_PER_GB
}

/// Pick a strategy. First match wins:
///
/// 1. accelerator primary and footprint above the threshold: ModelParallel
/// 2. accelerator primary with a general-purpose secondary: LayerOffload
/// 3. anything else: PipelineParallel
///
/// `ModelManager::load` never calls this for a pair of the same device kind
/// (e.g. Cuda and Cuda): such a pair is one device, so the whole model goes on
/// the primary slot and no strategy runs. The table still answers for same-kind
/// pairs when called directly.
pub fn select_strategy(
    primary: DeviceKind,
    secondary: DeviceKind,
    estimated_gb: f64,
    policy: &PolicySettings,
) -> StrategyKind {
    match (primary.is_accelerator(), secondary.is_accelerator()) {
        (true, _) if estimated_gb > policy.large_model_threshold_gb => StrategyKind::ModelParallel,
        (true, false) => StrategyKind::LayerOffload,
        _ => StrategyKind::PipelineParallel,
    }
}
