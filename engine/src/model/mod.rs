//! Model families, their parameters, and the handle the manager owns.

pub mod codec;
pub mod decoder;
pub mod link;
pub mod loader;
pub mod mock;
pub mod params;

pub use codec::{ByteCodec, HfTokenizerCodec, TokenCodec};
pub use decoder::{DecoderConfig, ReferenceDecoder};
pub use link::{route, Activation, DeviceLink, HostLink};
pub use loader::{LoadedArtifacts, ModelLoader, ReferenceLoader};
pub use params::{ParamInfo, ParameterStore, PlacementSummary};

use crate::device::DeviceRole;
use crate::errors::{EngineError, Result};
use crate::inference::GenerationParams;
use crate::tensor_ops::{sample_greedy, sample_token, Lcg, Tensor1D};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Module names of a decoder-style model, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecoderLayout {
    /// Token embedding lookup
    pub embeddings: String,

    /// Position embedding lookup, if the family has one
    pub pos_embeddings: Option<String>,

    /// Repeated layer blocks
    pub layers: Vec<String>,

    /// Final normalization
    pub final_norm: String,

    /// Hidden state to vocabulary logits
    pub output_projection: String,
}

/// Structural shape of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Architecture {
    Decoder(DecoderLayout),
    /// No decoder stack the engine can drive stage by stage
    Opaque,
}

/// One model family adapter.
///
/// Compute methods are strict about placement: a module invoked with an
/// activation on another device fails with `DeviceMismatch`. Only
/// `forward_logits` routes activations between devices on its own.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn family(&self) -> &str;

    fn parameters(&self) -> &ParameterStore;

    fn parameters_mut(&mut self) -> &mut ParameterStore;

    /// Top-level children in natural order. Stateless children are included.
    fn children(&self) -> Vec<String>;

    fn architecture(&self) -> Architecture;

    fn input_embeddings(&self) -> Option<String> {
        match self.architecture() {
            Architecture::Decoder(layout) => Some(layout.embeddings),
            Architecture::Opaque => None,
        }
    }

    fn output_embeddings(&self) -> Option<String> {
        match self.architecture() {
            Architecture::Decoder(layout) => Some(layout.output_projection),
            Architecture::Opaque => None,
        }
    }

    fn named_modules(&self) -> Vec<String> {
        self.parameters().module_names()
    }

    /// Move one module. Returns the number of parameter tensors moved.
    async fn relocate(&mut self, module: &str, device: DeviceRole) -> Result<usize> {
        self.parameters_mut().relocate(module, device)
    }

    async fn relocate_all(&mut self, device: DeviceRole) -> Result<()> {
        self.parameters_mut().relocate_all(device);
        Ok(())
    }

    /// Look up rows of an embedding module on `device`.
    fn embed(&self, module: &str, indices: &[u32], device: DeviceRole) -> Result<Activation>;

    /// Run one module over `input` on the device `input` lives on.
    fn forward_module(&self, module: &str, input: Activation) -> Result<Activation>;

    /// Full forward pass, routing activations to wherever each module lives.
    /// Returns logits for the last position.
    fn forward_logits(&self, ids: &[u32], link: &dyn DeviceLink) -> Result<Tensor1D>;

    /// Autoregressive generation as the family ships it.
    ///
    /// Returns the prompt followed by the generated ids.
    fn generate(
        &self,
        ids: &[u32],
        params: &GenerationParams,
        eos_token_id: u32,
        link: &dyn DeviceLink,
    ) -> Result<Vec<u32>> {
        sample_loop(ids, params, eos_token_id, |sequence| {
            self.forward_logits(sequence, link)
        })
    }

    /// Release transient buffers after placement.
    fn reclaim_memory(&mut self) {}
}

/// Autoregressive loop shared by model families: `logits` maps the current
/// sequence to next-token logits until EOS or `max_length`.
pub fn sample_loop<F>(
    ids: &[u32],
    params: &GenerationParams,
    eos_token_id: u32,
    mut logits: F,
) -> Result<Vec<u32>>
where
    F: FnMut(&[u32]) -> Result<Tensor1D>,
{
    let mut sequence = ids.to_vec();
    let mut rng = Lcg::new(params.seed);

    while sequence.len() < params.max_length {
        let logits = logits(&sequence)?;
        let next = if params.do_sample {
            sample_token(&logits, params.temperature, params.top_p, &mut rng)
        } else {
            sample_greedy(&logits)
        };
        sequence.push(next);
        if next == eos_token_id {
            break;
        }
    }

    Ok(sequence)
}

/// Fail unless every parameter of `module` is on `device`. Stateless modules pass.
pub fn ensure_on(store: &ParameterStore, module: &str, device: DeviceRole) -> Result<()> {
    match store.device_of(module) {
        Some(home) if home == device => Ok(()),
        Some(home) => Err(EngineError::DeviceMismatch {
            module: module.to_string(),
            expected: home.to_string(),
            found: device.to_string(),
        }),
        None if !store.has_module(module) => Ok(()),
        None => Err(EngineError::DeviceMismatch {
            module: module.to_string(),
            expected: "single device".to_string(),
            found: "split placement".to_string(),
        }),
    }
}

/// The loaded model, owned by the manager and borrowed by strategies.
pub struct ModelHandle {
    model: Box<dyn LanguageModel>,
    relocation_timeout: Duration,
}

impl ModelHandle {
    pub fn new(model: Box<dyn LanguageModel>, relocation_timeout: Duration) -> Self {
        Self {
            model,
            relocation_timeout,
        }
    }

    pub fn model(&self) -> &dyn LanguageModel {
        self.model.as_ref()
    }

    pub fn family(&self) -> &str {
        self.model.family()
    }

    pub fn children(&self) -> Vec<String> {
        self.model.children()
    }

    pub fn named_modules(&self) -> Vec<String> {
        self.model.named_modules()
    }

    pub fn architecture(&self) -> Architecture {
        self.model.architecture()
    }

    pub fn input_embeddings(&self) -> Option<String> {
        self.model.input_embeddings()
    }

    pub fn output_embeddings(&self) -> Option<String> {
        self.model.output_embeddings()
    }

    pub fn parameter_count(&self) -> u64 {
        self.model.parameters().parameter_count()
    }

    pub fn device_of(&self, module: &str) -> Option<DeviceRole> {
        self.model.parameters().device_of(module)
    }

    pub fn placement(&self) -> PlacementSummary {
        self.model.parameters().placement()
    }

    /// Relocate one module under the configured timeout.
    ///
    /// Expiry is reported as a relocation failure.
    pub async fn relocate(&mut self, module: &str, device: DeviceRole) -> Result<usize> {
        let timeout_ms = self.relocation_timeout.as_millis() as u64;
        match tokio::time::timeout(self.relocation_timeout, self.model.relocate(module, device))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Relocation {
                module: module.to_string(),
                reason: format!("timed out after {} ms", timeout_ms),
            }),
        }
    }

    /// Budget for a whole-model move: the per-module timeout once per module.
    pub fn whole_model_timeout(&self) -> Duration {
        let modules = self.model.named_modules().len().max(1);
        self.relocation_timeout
            .saturating_mul(u32::try_from(modules).unwrap_or(u32::MAX))
    }

    /// Move the whole model to one device.
    ///
    /// Expiry is reported as a relocation failure, like a per-module move.
    pub async fn relocate_all(&mut self, device: DeviceRole) -> Result<()> {
        let budget = self.whole_model_timeout();
        match tokio::time::timeout(budget, self.model.relocate_all(device)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Relocation {
                module: "<all>".to_string(),
                reason: format!("moving to {} timed out after {} ms", device, budget.as_millis()),
            }),
        }
    }

    pub fn reclaim_memory(&mut self) {
        self.model.reclaim_memory();
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("family", &self.model.family())
            .field("parameters", &self.parameter_count())
            .field("relocation_timeout", &self.relocation_timeout)
            .finish()
    }
}
