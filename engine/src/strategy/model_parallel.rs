use super::{split_index, DistributionOutcome, DistributionStrategy, Placement, RelocationReport, StrategyKind};
use crate::device::{DevicePair, DeviceRole};
use crate::errors::Result;
use crate::model::ModelHandle;
use async_trait::async_trait;

/// Contiguous, disjoint shares of top-level children per device.
///
/// The sharded model stays a single callable unit; its own forward pass routes
/// activations between the two devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelParallel;

#[async_trait]
impl DistributionStrategy for ModelParallel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ModelParallel
    }

    #[tracing::instrument(skip_all, fields(strategy = "model_parallel"))]
    async fn apply(&self, model: &mut ModelHandle, devices: &DevicePair) -> Result<DistributionOutcome> {
        let children = model.children();
        let split = split_index(children.len(), devices.primary.weight);
        let mut report = RelocationReport::default();

        tracing::info!(
            children = children.len(),
            split_index = split,
            primary = %devices.primary.kind,
            secondary = %devices.secondary.kind,
            "Sharding top-level modules"
        );

        for (i, child) in children.iter().enumerate() {
            let target = if i < split {
                DeviceRole::Primary
            } else {
                DeviceRole::Secondary
            };
            let result = model.relocate(child, target).await;
            report.record(child, result);
        }

        Ok(DistributionOutcome {
            strategy: Some(StrategyKind::ModelParallel),
            is_sharded: true,
            stage_map: None,
            placement: Placement::of(model),
            relocations: report,
        })
    }
}
