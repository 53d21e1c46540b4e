//! Placement of a model across the primary and secondary device.

mod layer_offload;
mod model_parallel;
mod pipeline;
mod selector;
mod stage_map;

pub use layer_offload::{LayerOffload, ATTENTION_PATTERNS};
pub use model_parallel::ModelParallel;
pub use pipeline::PipelineParallel;
pub use selector::{estimate_size_gb, select_strategy};
pub use stage_map::{PipelineStage, PipelineStageMap, StageName};

use crate::device::{DevicePair, DeviceRole};
use crate::errors::Result;
use crate::model::ModelHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ModelParallel,
    PipelineParallel,
    LayerOffload,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ModelParallel => "model_parallel",
            StrategyKind::PipelineParallel => "pipeline_parallel",
            StrategyKind::LayerOffload => "layer_offload",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the parameters ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Parameters on both devices
    Split,
    /// Every parameter on one device
    Single(DeviceRole),
}

impl Placement {
    pub fn of(model: &ModelHandle) -> Self {
        match model.placement().single_device() {
            Some(device) => Placement::Single(device),
            None => Placement::Split,
        }
    }
}

/// Per-module relocation bookkeeping for one `apply`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelocationReport {
    pub succeeded: usize,
    pub skipped: Vec<String>,
}

impl RelocationReport {
    /// Record one relocation attempt. Failures are logged and skipped.
    pub(crate) fn record(&mut self, module: &str, result: Result<usize>) -> bool {
        match result {
            Ok(_) => {
                self.succeeded += 1;
                true
            }
            Err(e) => {
                tracing::warn!(module = %module, error = %e, "Skipping module relocation");
                self.skipped.push(module.to_string());
                false
            }
        }
    }
}

/// Result of placing a model, produced once per load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionOutcome {
    /// `None` when both slots are the same device and no strategy ran
    pub strategy: Option<StrategyKind>,
    pub is_sharded: bool,
    pub stage_map: Option<PipelineStageMap>,
    pub placement: Placement,
    pub relocations: RelocationReport,
}

/// Put the whole model on the primary device when a strategy abandons its layout.
///
/// A failed move is logged and recorded as a skipped `<all>` relocation; the
/// outcome then reports wherever the parameters actually are.
pub(crate) async fn collapse_to_primary(
    model: &mut ModelHandle,
    strategy: Option<StrategyKind>,
    mut relocations: RelocationReport,
) -> DistributionOutcome {
    if let Err(e) = model.relocate_all(DeviceRole::Primary).await {
        tracing::warn!(error = %e, "Whole-model move to primary failed, keeping current placement");
        relocations.skipped.push("<all>".to_string());
    }

    DistributionOutcome {
        strategy,
        is_sharded: false,
        stage_map: None,
        placement: Placement::of(model),
        relocations,
    }
}

/// A way of laying a model out across two devices.
#[async_trait]
pub trait DistributionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Place `model` on `devices`. Relocation failures, whole-model moves
    /// included, degrade the placement rather than fail it.
    async fn apply(&self, model: &mut ModelHandle, devices: &DevicePair) -> Result<DistributionOutcome>;
}

pub fn strategy_for(kind: StrategyKind) -> Box<dyn DistributionStrategy> {
    match kind {
        StrategyKind::ModelParallel => Box::new(ModelParallel),
        StrategyKind::PipelineParallel => Box::new(PipelineParallel),
        StrategyKind::LayerOffload => Box::new(LayerOffload),
    }
}

/// `ceil(count * weight)`, clamped to `count`.
pub fn split_index(count: usize, weight: f64) -> usize {
    ((count as f64 * weight).ceil() as usize).min(count)
}
