//! Shared fixtures for integration tests.

#![allow(dead_code)]

use engine::config::{BusyPolicy, EngineConfig};
use engine::device::{DeviceKind, DevicePair, DeviceProfile, DeviceRole};
use engine::model::mock::{ScriptedLoader, ScriptedSpec};
use engine::model::{DecoderConfig, DeviceLink, HostLink, ReferenceDecoder, ReferenceLoader};
use engine::ModelManager;
use std::path::Path;
use std::sync::Arc;

pub const CHAT_PROMPT: &str = "User: test\nAssistant:";

pub fn pair(primary: DeviceKind, secondary: DeviceKind) -> DevicePair {
    DevicePair::new(
        DeviceProfile::new(DeviceRole::Primary, primary, 0.85).unwrap(),
        DeviceProfile::new(DeviceRole::Secondary, secondary, 0.15).unwrap(),
    )
    .unwrap()
}

pub fn config_with_policy(policy: BusyPolicy) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.model_path = "scripted".to_string();
    config.runtime.busy_policy = policy;
    config
}

pub fn scripted_manager(spec: ScriptedSpec, devices: DevicePair) -> ModelManager {
    scripted_manager_with(spec, devices, EngineConfig::default(), Arc::new(HostLink))
}

pub fn scripted_manager_with(
    spec: ScriptedSpec,
    devices: DevicePair,
    config: EngineConfig,
    link: Arc<dyn DeviceLink>,
) -> ModelManager {
    ModelManager::new(config, devices, Arc::new(ScriptedLoader::new(spec)), link)
}

pub fn tiny_decoder_config() -> DecoderConfig {
    DecoderConfig {
        vocab_size: 257,
        n_positions: 64,
        n_embd: 16,
        n_layer: 4,
        n_head: 2,
        layer_norm_epsilon: 1e-5,
        eos_token_id: Some(256),
    }
}

/// Write `config.json` and `model.safetensors` for a seeded decoder.
pub fn write_checkpoint(dir: &Path, config: &DecoderConfig, seed: u64) {
    let decoder = ReferenceDecoder::seeded(config.clone(), seed).unwrap();
    std::fs::write(dir.join("config.json"), serde_json::to_string(config).unwrap()).unwrap();
    std::fs::write(dir.join("model.safetensors"), decoder.to_safetensors().unwrap()).unwrap();
}

pub fn checkpoint_manager(dir: &Path, devices: DevicePair) -> ModelManager {
    let mut config = EngineConfig::default();
    config.model_path = dir.to_string_lossy().into_owned();
    ModelManager::new(
        config,
        devices,
        Arc::new(ReferenceLoader::default()),
        Arc::new(HostLink),
    )
}
