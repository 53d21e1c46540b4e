use super::{
    collapse_to_primary, DistributionOutcome, DistributionStrategy, Placement, RelocationReport,
    StrategyKind,
};
use crate::device::{DevicePair, DeviceRole};
use crate::errors::Result;
use crate::model::ModelHandle;
use async_trait::async_trait;

/// Name fragments that mark a sub-module as attention.
pub const ATTENTION_PATTERNS: [&str; 3] = ["attn", "attention", "self"];

/// Bulk of the model on the secondary device, attention and embeddings on the primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayerOffload;

impl LayerOffload {
    fn is_attention(module: &str) -> bool {
        let lowered = module.to_lowercase();
        ATTENTION_PATTERNS.iter().any(|p| lowered.contains(p))
    }
}

#[async_trait]
impl DistributionStrategy for LayerOffload {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LayerOffload
    }

    #[tracing::instrument(skip_all, fields(strategy = "layer_offload"))]
    async fn apply(&self, model: &mut ModelHandle, devices: &DevicePair) -> Result<DistributionOutcome> {
        let mut report = RelocationReport::default();

        if let Err(e) = model.relocate_all(DeviceRole::Secondary).await {
            tracing::warn!(error = %e, "Could not move model to secondary, placing whole model on primary");
            report.skipped.push("<all>".to_string());
            return Ok(collapse_to_primary(model, Some(StrategyKind::LayerOffload), report).await);
        }

        for module in model.named_modules() {
            if Self::is_attention(&module) {
                let result = model.relocate(&module, DeviceRole::Primary).await;
                report.record(&module, result);
            }
        }

        for module in [model.input_embeddings(), model.output_embeddings()]
            .into_iter()
            .flatten()
        {
            let result = model.relocate(&module, DeviceRole::Primary).await;
            report.record(&module, result);
        }

        if report.succeeded == 0 {
            tracing::warn!(
                family = model.family(),
                "No attention or embedding modules found, placing whole model on primary"
            );
            return Ok(collapse_to_primary(model, Some(StrategyKind::LayerOffload), report).await);
        }

        tracing::info!(
            kept_on_primary = report.succeeded,
            primary = %devices.primary.kind,
            secondary = %devices.secondary.kind,
            "Offloaded non-attention modules"
        );

        Ok(DistributionOutcome {
            strategy: Some(StrategyKind::LayerOffload),
            is_sharded: false,
            stage_map: None,
            placement: Placement::of(model),
            relocations: report,
        })
    }
}
