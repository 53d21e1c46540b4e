use super::{
    collapse_to_primary, split_index, DistributionOutcome, DistributionStrategy, PipelineStage,
    PipelineStageMap, Placement, RelocationReport, StageName, StrategyKind,
};
use crate::device::{DevicePair, DeviceRole};
use crate::errors::Result;
use crate::model::{Architecture, DecoderLayout, ModelHandle};
use async_trait::async_trait;

/// Two sequential stages: embeddings and early layers on the primary device,
/// late layers and the output head on the secondary device.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineParallel;

impl PipelineParallel {
    fn build_stages(layout: &DecoderLayout, split: usize) -> Vec<PipelineStage> {
        let mut stages = vec![PipelineStage::new(
            StageName::Embeddings,
            vec![layout.embeddings.clone()],
            DeviceRole::Primary,
        )];

        if let Some(pos) = &layout.pos_embeddings {
            stages.push(PipelineStage::new(
                StageName::PosEmbeddings,
                vec![pos.clone()],
                DeviceRole::Primary,
            ));
        }

        let (early, late) = layout.layers.split_at(split);
        stages.extend([
            PipelineStage::new(StageName::EarlyLayers, early.to_vec(), DeviceRole::Primary),
            PipelineStage::new(StageName::LateLayers, late.to_vec(), DeviceRole::Secondary),
            PipelineStage::new(
                StageName::OutputHead,
                vec![layout.final_norm.clone()],
                DeviceRole::Secondary,
            ),
            PipelineStage::new(
                StageName::OutputProjection,
                vec![layout.output_projection.clone()],
                DeviceRole::Secondary,
            ),
        ]);

        stages
    }
}

#[async_trait]
impl DistributionStrategy for PipelineParallel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PipelineParallel
    }

    #[tracing::instrument(skip_all, fields(strategy = "pipeline_parallel"))]
    async fn apply(&self, model: &mut ModelHandle, devices: &DevicePair) -> Result<DistributionOutcome> {
        let layout = match model.architecture() {
            Architecture::Decoder(layout) => layout,
            Architecture::Opaque => {
                tracing::warn!(
                    family = model.family(),
                    "Model has no decoder stack, placing whole model on primary"
                );
                return Ok(collapse_to_primary(
                    model,
                    Some(StrategyKind::PipelineParallel),
                    RelocationReport::default(),
                )
                .await);
            }
        };

        let split = split_index(layout.layers.len(), devices.primary.weight);
        let stages = Self::build_stages(&layout, split);
        let stage_map = match PipelineStageMap::new(stages) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid stage layout, placing whole model on primary");
                return Ok(collapse_to_primary(
                    model,
                    Some(StrategyKind::PipelineParallel),
                    RelocationReport::default(),
                )
                .await);
            }
        };

        tracing::info!(
            layers = layout.layers.len(),
            split_point = split,
            primary = %devices.primary.kind,
            secondary = %devices.secondary.kind,
            "Building pipeline stages"
        );

        let mut report = RelocationReport::default();
        for stage in stage_map.stages() {
            for module in &stage.modules {
                let result = model.relocate(module, stage.device).await;
                report.record(module, result);
            }
            tracing::debug!(
                stage = %stage.name,
                device = %stage.device,
                modules = stage.modules.len(),
                "Stage placed"
            );
        }

        Ok(DistributionOutcome {
            strategy: Some(StrategyKind::PipelineParallel),
            is_sharded: false,
            placement: Placement::of(model),
            stage_map: Some(stage_map),
            relocations: report,
        })
    }
}
