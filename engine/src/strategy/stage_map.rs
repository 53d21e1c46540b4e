use crate::device::DeviceRole;
use crate::errors::{EngineError, Result};
use serde::Serialize;
use std::fmt;

/// Stage names in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Embeddings,
    PosEmbeddings,
    EarlyLayers,
    LateLayers,
    OutputHead,
    OutputProjection,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Embeddings => "embeddings",
            StageName::PosEmbeddings => "pos_embeddings",
            StageName::EarlyLayers => "early_layers",
            StageName::LateLayers => "late_layers",
            StageName::OutputHead => "output_head",
            StageName::OutputProjection => "output_projection",
        }
    }

    /// Device a stage must be bound to, when it is fixed.
    fn required_device(&self) -> Option<DeviceRole> {
        match self {
            StageName::EarlyLayers => Some(DeviceRole::Primary),
            StageName::LateLayers | StageName::OutputHead | StageName::OutputProjection => {
                Some(DeviceRole::Secondary)
            }
            StageName::Embeddings | StageName::PosEmbeddings => None,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStage {
    pub name: StageName,
    /// Modules run in this order; may be empty
    pub modules: Vec<String>,
    pub device: DeviceRole,
}

impl PipelineStage {
    pub fn new(name: StageName, modules: Vec<String>, device: DeviceRole) -> Self {
        Self {
            name,
            modules,
            device,
        }
    }
}

/// Ordered, device-bound stages of a decoder split. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStageMap {
    stages: Vec<PipelineStage>,
}

impl PipelineStageMap {
    const REQUIRED: [StageName; 4] = [
        StageName::Embeddings,
        StageName::EarlyLayers,
        StageName::LateLayers,
        StageName::OutputHead,
    ];

    pub fn new(stages: Vec<PipelineStage>) -> Result<Self> {
        if stages.windows(2).any(|w| w[0].name >= w[1].name) {
            return Err(EngineError::Structure(
                "pipeline stages must be unique and in execution order".to_string(),
            ));
        }

        for required in Self::REQUIRED {
            if !stages.iter().any(|s| s.name == required) {
                return Err(EngineError::Structure(format!(
                    "pipeline is missing the '{}' stage",
                    required
                )));
            }
        }

        for stage in &stages {
            if let Some(device) = stage.name.required_device() {
                if stage.device != device {
                    return Err(EngineError::Structure(format!(
                        "stage '{}' must be bound to the {} device",
                        stage.name, device
                    )));
                }
            }
        }

        Ok(Self { stages })
    }

    pub fn stage(&self, name: StageName) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn require(&self, name: StageName) -> Result<&PipelineStage> {
        self.stage(name).ok_or_else(|| {
            EngineError::Structure(format!("pipeline has no '{}' stage", name))
        })
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: StageName, device: DeviceRole) -> PipelineStage {
        PipelineStage::new(name, vec![], device)
    }

    fn valid() -> Vec<PipelineStage> {
        vec![
            stage(StageName::Embeddings, DeviceRole::Primary),
            stage(StageName::EarlyLayers, DeviceRole::Primary),
            stage(StageName::LateLayers, DeviceRole::Secondary),
            stage(StageName::OutputHead, DeviceRole::Secondary),
        ]
    }

    #[test]
    fn test_minimal_map_is_valid() {
        let map = PipelineStageMap::new(valid()).unwrap();
        assert!(map.stage(StageName::PosEmbeddings).is_none());
        assert!(map.require(StageName::OutputHead).is_ok());
    }

    #[test]
    fn test_early_layers_must_be_primary() {
        let mut stages = valid();
        stages[1].device = DeviceRole::Secondary;
        assert!(PipelineStageMap::new(stages).is_err());
    }

    #[test]
    fn test_missing_required_stage() {
        let mut stages = valid();
        stages.remove(2);
        assert!(PipelineStageMap::new(stages).is_err());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut stages = valid();
        stages.swap(0, 1);
        assert!(PipelineStageMap::new(stages).is_err());
    }
}
