//! Owns the loaded model and the single generation slot.
//!
//! Load, strategy selection, and placement run under an exclusive lock;
//! generation holds the shared side of the same lock, so a reload waits for
//! the in-flight request to finish.

use crate::config::{BusyPolicy, EngineConfig};
use crate::device::{resolve_devices, DevicePair, HardwareInventory};
use crate::errors::{EngineError, Result};
use crate::inference::{
    GenerationParams, GenerationRequest, GenerationResult, InferenceEngine, InferenceStats,
    StatsSnapshot,
};
use crate::model::{DeviceLink, HostLink, ModelHandle, ModelLoader, ReferenceLoader};
use crate::strategy::{
    collapse_to_primary, estimate_size_gb, select_strategy, strategy_for, DistributionOutcome,
    RelocationReport, StrategyKind,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};
use tracing::{info, instrument, warn};

/// One generation at a time per loaded model; the policy decides what waiting callers get.
#[derive(Debug)]
struct GenerationGate {
    slot: Semaphore,
    policy: BusyPolicy,
}

impl GenerationGate {
    fn new(policy: BusyPolicy) -> Self {
        Self {
            slot: Semaphore::new(1),
            policy,
        }
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        match self.policy {
            BusyPolicy::Reject => self
                .slot
                .try_acquire()
                .map_err(|_| EngineError::Busy("a generation is already in flight".to_string())),
            BusyPolicy::Queue { timeout_ms } => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), self.slot.acquire())
                    .await
                {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(EngineError::Busy("generation slot closed".to_string())),
                    Err(_) => Err(EngineError::Busy(format!(
                        "no generation slot within {} ms",
                        timeout_ms
                    ))),
                }
            }
        }
    }
}

struct LoadedModel {
    engine: InferenceEngine,
    outcome: DistributionOutcome,
    model_path: String,
    family: String,
    parameter_count: u64,
    estimated_size_gb: f64,
}

/// What `status` reports. Weights are percentages, e.g. `"85%"`.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub loaded: bool,
    pub model_path: String,
    pub family: Option<String>,
    pub parameter_count: Option<u64>,
    pub estimated_size_gb: Option<f64>,
    pub primary_device: String,
    pub secondary_device: String,
    pub primary_weight: String,
    pub secondary_weight: String,
    pub is_sharded: bool,
    pub strategy: Option<StrategyKind>,
    pub pipelined: bool,
    pub hardware: Option<HardwareInventory>,
    pub stats: StatsSnapshot,
}

pub struct ModelManager {
    config: EngineConfig,
    devices: DevicePair,
    hardware: Option<HardwareInventory>,
    loader: Arc<dyn ModelLoader>,
    link: Arc<dyn DeviceLink>,
    state: RwLock<Option<LoadedModel>>,
    gate: GenerationGate,
    stats: Arc<InferenceStats>,
}

impl ModelManager {
    pub fn new(
        config: EngineConfig,
        devices: DevicePair,
        loader: Arc<dyn ModelLoader>,
        link: Arc<dyn DeviceLink>,
    ) -> Self {
        let gate = GenerationGate::new(config.runtime.busy_policy);
        Self {
            config,
            devices,
            hardware: None,
            loader,
            link,
            state: RwLock::new(None),
            gate,
            stats: Arc::new(InferenceStats::new()),
        }
    }

    /// Probe the host, resolve devices, and use the reference loader.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let hardware = HardwareInventory::detect();
        let devices = resolve_devices(&hardware, &config.devices)?;

        let mut manager = Self::new(
            config,
            devices,
            Arc::new(ReferenceLoader::default()),
            Arc::new(HostLink),
        );
        manager.hardware = Some(hardware);
        Ok(manager)
    }

    pub fn with_hardware(mut self, hardware: HardwareInventory) -> Self {
        self.hardware = Some(hardware);
        self
    }

    pub fn devices(&self) -> &DevicePair {
        &self.devices
    }

    pub fn stats(&self) -> &Arc<InferenceStats> {
        &self.stats
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Load the configured model, choose a strategy, and place the model.
    ///
    /// Replaces any previously loaded model. A failed load leaves nothing loaded.
    #[instrument(skip(self), fields(model_path = %self.config.model_path))]
    pub async fn load(&self) -> Result<DistributionOutcome> {
        let mut state = self.state.write().await;
        if state.take().is_some() {
            info!("Unloading previous model");
        }

        let artifacts = self.loader.load(&self.config.model_path).await.map_err(|e| match e {
            EngineError::Load(_) => e,
            other => EngineError::Load(other.to_string()),
        })?;

        let mut model = ModelHandle::new(
            artifacts.model,
            Duration::from_millis(self.config.runtime.relocation_timeout_ms),
        );
        let parameter_count = model.parameter_count();
        let estimated_size_gb = estimate_size_gb(parameter_count, self.devices.primary.bytes_per_param);

        info!(
            family = model.family(),
            parameters = parameter_count,
            estimated_gb = format!("{:.2}", estimated_size_gb),
            "Model loaded"
        );

        let outcome = self.place(&mut model, estimated_size_gb).await?;
        model.reclaim_memory();

        info!(
            strategy = outcome.strategy.map(|s| s.as_str()).unwrap_or("none"),
            is_sharded = outcome.is_sharded,
            pipelined = outcome.stage_map.is_some(),
            skipped_relocations = outcome.relocations.skipped.len(),
            "Model placed"
        );

        let family = model.family().to_string();
        let engine = InferenceEngine::new(
            model,
            artifacts.codec,
            Arc::clone(&self.link),
            outcome.stage_map.clone(),
            self.config.prompt.clone(),
            Arc::clone(&self.stats),
        );

        *state = Some(LoadedModel {
            engine,
            outcome: outcome.clone(),
            model_path: self.config.model_path.clone(),
            family,
            parameter_count,
            estimated_size_gb,
        });

        Ok(outcome)
    }

    async fn place(&self, model: &mut ModelHandle, estimated_size_gb: f64) -> Result<DistributionOutcome> {
        if self.devices.is_single_device() {
            info!(device = %self.devices.primary.kind, "Single device, skipping distribution");
            return Ok(collapse_to_primary(model, None, RelocationReport::default()).await);
        }

        let kind = select_strategy(
            self.devices.primary.kind,
            self.devices.secondary.kind,
            estimated_size_gb,
            &self.config.policy,
        );
        info!(strategy = %kind, "Selected distribution strategy");

        strategy_for(kind).apply(model, &self.devices).await
    }

    /// Generate a reply to `prompt`. `None` uses the configured parameters.
    ///
    /// Failures other than "not loaded" and "busy" surface as a generation error.
    pub async fn generate(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<GenerationResult> {
        let params = params.unwrap_or_else(|| self.config.generation.clone());
        self.submit(GenerationRequest::text(prompt).with_params(params))
            .await
    }

    pub async fn submit(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let state = self.state.read().await;
        let loaded = state.as_ref().ok_or(EngineError::NotLoaded)?;

        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                self.stats.record_rejected();
                warn!(request_id = %request.id, error = %e, "Generation rejected");
                return Err(e);
            }
        };

        loaded.engine.generate(&request).await.map_err(|e| match e {
            EngineError::NotLoaded | EngineError::Busy(_) | EngineError::Generation(_) => e,
            other => EngineError::Generation(other.to_string()),
        })
    }

    pub async fn status(&self) -> ManagerStatus {
        let state = self.state.read().await;
        let loaded = state.as_ref();

        ManagerStatus {
            loaded: loaded.is_some(),
            model_path: loaded
                .map(|l| l.model_path.clone())
                .unwrap_or_else(|| self.config.model_path.clone()),
            family: loaded.map(|l| l.family.clone()),
            parameter_count: loaded.map(|l| l.parameter_count),
            estimated_size_gb: loaded.map(|l| l.estimated_size_gb),
            primary_device: self.devices.primary.kind.to_string(),
            secondary_device: self.devices.secondary.kind.to_string(),
            primary_weight: self.devices.primary.weight_percent(),
            secondary_weight: self.devices.secondary.weight_percent(),
            is_sharded: loaded.map(|l| l.outcome.is_sharded).unwrap_or(false),
            strategy: loaded.and_then(|l| l.outcome.strategy),
            pipelined: loaded.map(|l| l.engine.is_pipelined()).unwrap_or(false),
            hardware: self.hardware.clone(),
            stats: self.stats.snapshot(),
        }
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("model_path", &self.config.model_path)
            .field("devices", &self.devices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DeviceProfile, DeviceRole};
    use crate::model::mock::{ScriptedLoader, ScriptedSpec};
    use crate::strategy::Placement;

    fn pair(primary: DeviceKind, secondary: DeviceKind) -> DevicePair {
        DevicePair::new(
            DeviceProfile::new(DeviceRole::Primary, primary, 0.85).unwrap(),
            DeviceProfile::new(DeviceRole::Secondary, secondary, 0.15).unwrap(),
        )
        .unwrap()
    }

    fn manager(spec: ScriptedSpec, devices: DevicePair) -> ModelManager {
        ModelManager::new(
            EngineConfig::default(),
            devices,
            Arc::new(ScriptedLoader::new(spec)),
            Arc::new(HostLink),
        )
    }

    #[tokio::test]
    async fn test_generate_before_load() {
        let manager = manager(ScriptedSpec::decoder(2), pair(DeviceKind::Npu, DeviceKind::Cpu));
        let err = manager.generate("hi", None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotLoaded));
    }

    #[tokio::test]
    async fn test_single_device_skips_strategy() {
        let manager = manager(ScriptedSpec::decoder(4), pair(DeviceKind::Cpu, DeviceKind::Cpu));
        let outcome = manager.load().await.unwrap();

        assert_eq!(outcome.strategy, None);
        assert!(!outcome.is_sharded);
        assert!(outcome.stage_map.is_none());
        assert_eq!(outcome.placement, Placement::Single(DeviceRole::Primary));
    }

    #[tokio::test]
    async fn test_accelerator_with_cpu_offloads() {
        let manager = manager(ScriptedSpec::decoder(4), pair(DeviceKind::Cuda, DeviceKind::Cpu));
        let outcome = manager.load().await.unwrap();
        assert_eq!(outcome.strategy, Some(StrategyKind::LayerOffload));
    }

    #[tokio::test]
    async fn test_slow_whole_model_move_still_loads() {
        let mut config = EngineConfig::default();
        config.runtime.relocation_timeout_ms = 10;
        let spec = ScriptedSpec::decoder(2)
            .with_reply(" ok")
            .with_relocate_all_delay(Duration::from_millis(500));
        let manager = ModelManager::new(
            config,
            pair(DeviceKind::Cuda, DeviceKind::Cpu),
            Arc::new(ScriptedLoader::new(spec)),
            Arc::new(HostLink),
        );

        let outcome = manager.load().await.unwrap();

        assert!(manager.is_loaded().await);
        assert_eq!(outcome.strategy, Some(StrategyKind::LayerOffload));
        assert_eq!(outcome.placement, Placement::Single(DeviceRole::Primary));
        let result = manager.generate("User: x\nAssistant:", None).await.unwrap();
        assert_eq!(result.text, "ok");
    }

    #[tokio::test]
    async fn test_failing_loader_is_load_error() {
        let manager = ModelManager::new(
            EngineConfig::default(),
            pair(DeviceKind::Npu, DeviceKind::Cpu),
            Arc::new(ScriptedLoader::failing()),
            Arc::new(HostLink),
        );

        assert!(matches!(manager.load().await, Err(EngineError::Load(_))));
        assert!(!manager.is_loaded().await);
    }

    #[tokio::test]
    async fn test_status_before_and_after_load() {
        let manager = manager(ScriptedSpec::decoder(4), pair(DeviceKind::Npu, DeviceKind::Cuda));

        let before = manager.status().await;
        assert!(!before.loaded);
        assert_eq!(before.primary_weight, "85%");
        assert_eq!(before.secondary_weight, "15%");
        assert_eq!(before.strategy, None);

        manager.load().await.unwrap();
        let after = manager.status().await;
        assert!(after.loaded);
        assert_eq!(after.primary_device, "npu");
        assert_eq!(after.secondary_device, "cuda");
        assert_eq!(after.strategy, Some(StrategyKind::PipelineParallel));
        assert!(after.pipelined);
        assert_eq!(after.parameter_count, Some(800));
    }

    #[tokio::test]
    async fn test_reject_policy_when_slot_taken() {
        let mut config = EngineConfig::default();
        config.runtime.busy_policy = BusyPolicy::Reject;
        let manager = ModelManager::new(
            config,
            pair(DeviceKind::Npu, DeviceKind::Cpu),
            Arc::new(ScriptedLoader::new(ScriptedSpec::decoder(2))),
            Arc::new(HostLink),
        );
        manager.load().await.unwrap();

        let _held = manager.gate.acquire().await.unwrap();
        let err = manager.generate("User: x\nAssistant:", None).await.unwrap_err();

        assert!(matches!(err, EngineError::Busy(_)));
        assert_eq!(manager.stats().snapshot().requests_rejected, 1);
    }

    #[tokio::test]
    async fn test_queue_policy_times_out() {
        let mut config = EngineConfig::default();
        config.runtime.busy_policy = BusyPolicy::Queue { timeout_ms: 20 };
        let manager = ModelManager::new(
            config,
            pair(DeviceKind::Npu, DeviceKind::Cpu),
            Arc::new(ScriptedLoader::new(ScriptedSpec::decoder(2))),
            Arc::new(HostLink),
        );
        manager.load().await.unwrap();

        let _held = manager.gate.acquire().await.unwrap();
        let err = manager.generate("q", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Busy(_)));
    }

    #[tokio::test]
    async fn test_engine_errors_surface_as_generation_errors() {
        let manager = manager(ScriptedSpec::decoder(2), pair(DeviceKind::Npu, DeviceKind::Cpu));
        manager.load().await.unwrap();

        let err = manager
            .generate("x", Some(GenerationParams::default().with_max_length(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));
    }
}
