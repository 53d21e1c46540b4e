//! Scripted model family for exercising placement and generation without weights.
//!
//! Hidden states are a single row holding the token ids, every layer is the
//! identity, and the head emits a sharply peaked distribution over the byte of
//! a fixed reply that follows the last token. Parameter counts are virtual, so a "15 GB" model costs
//! nothing to build.

use super::{
    ensure_on, route, sample_loop, Activation, Architecture, ByteCodec, DecoderLayout,
    DeviceLink, LanguageModel, LoadedArtifacts, ModelHandle, ModelLoader, ParameterStore,
};
use crate::device::DeviceRole;
use crate::errors::{EngineError, Result};
use crate::inference::GenerationParams;
use crate::tensor_ops::{Tensor1D, Tensor2D};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Enter/exit timestamps of every native generation call.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    windows: Mutex<Vec<(Instant, Instant)>>,
}

impl ExecutionLog {
    pub fn record(&self, start: Instant, end: Instant) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.push((start, end));
        }
    }

    pub fn windows(&self) -> Vec<(Instant, Instant)> {
        self.windows.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Whether any two recorded windows overlap in time.
    pub fn has_overlap(&self) -> bool {
        let mut windows = self.windows();
        windows.sort_by_key(|(start, _)| *start);
        windows.windows(2).any(|pair| pair[1].0 < pair[0].1)
    }
}

/// Blueprint for a scripted model.
#[derive(Debug, Clone)]
pub struct ScriptedSpec {
    /// Top-level children with their parameter counts; zero means stateless
    pub children: Vec<(String, u64)>,
    /// Layer names when the model is decoder shaped
    pub layers: Option<Vec<String>>,
    /// Token ids the head produces after the prompt
    pub reply: Vec<u32>,
    pub eos: u32,
    pub vocab_size: usize,
    /// Blocking time spent inside each native generation call
    pub compute_delay: Duration,
    /// Time each relocation takes
    pub relocate_delay: Duration,
    /// Time each whole-model move takes
    pub relocate_all_delay: Duration,
    pub log: Option<Arc<ExecutionLog>>,
}

impl ScriptedSpec {
    pub fn opaque(children: Vec<(String, u64)>) -> Self {
        Self {
            children,
            layers: None,
            reply: b" ok".iter().map(|&b| u32::from(b)).collect(),
            eos: ByteCodec::EOS,
            vocab_size: ByteCodec::EOS as usize + 1,
            compute_delay: Duration::ZERO,
            relocate_delay: Duration::ZERO,
            relocate_all_delay: Duration::ZERO,
            log: None,
        }
    }

    /// Children `embed`, `pos`, `h.0` .. `h.{n-1}`, `norm`, `head`.
    pub fn decoder(n_layers: usize) -> Self {
        let layers: Vec<String> = (0..n_layers).map(|i| format!("h.{}", i)).collect();
        let mut children = vec![("embed".to_string(), 100), ("pos".to_string(), 100)];
        children.extend(layers.iter().map(|l| (l.clone(), 100)));
        children.push(("norm".to_string(), 100));
        children.push(("head".to_string(), 100));

        Self {
            layers: Some(layers),
            ..Self::opaque(children)
        }
    }

    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.bytes().map(u32::from).collect();
        self
    }

    /// Give every stateful child `numel` parameters.
    pub fn with_params_per_module(mut self, numel: u64) -> Self {
        for (_, count) in self.children.iter_mut() {
            if *count > 0 {
                *count = numel;
            }
        }
        self
    }

    pub fn with_compute_delay(mut self, delay: Duration) -> Self {
        self.compute_delay = delay;
        self
    }

    pub fn with_relocate_delay(mut self, delay: Duration) -> Self {
        self.relocate_delay = delay;
        self
    }

    pub fn with_relocate_all_delay(mut self, delay: Duration) -> Self {
        self.relocate_all_delay = delay;
        self
    }

    pub fn with_log(mut self, log: Arc<ExecutionLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(&self) -> ScriptedModel {
        let mut params = ParameterStore::new();
        for (name, numel) in &self.children {
            if *numel > 0 {
                params.register(format!("{}.weight", name), *numel, DeviceRole::Primary);
            }
        }
        ScriptedModel {
            spec: self.clone(),
            params,
        }
    }

    pub fn handle(&self) -> ModelHandle {
        self.handle_with_timeout(Duration::from_secs(5))
    }

    pub fn handle_with_timeout(&self, relocation_timeout: Duration) -> ModelHandle {
        ModelHandle::new(Box::new(self.build()), relocation_timeout)
    }
}

pub struct ScriptedModel {
    spec: ScriptedSpec,
    params: ParameterStore,
}

impl ScriptedModel {
    /// The reply is a chain keyed on the last token, so reply bytes must be distinct.
    fn next_token(&self, ids: &[u32]) -> u32 {
        let reply = &self.spec.reply;
        let Some(last) = ids.last() else {
            return self.spec.eos;
        };
        match reply.iter().position(|t| t == last) {
            Some(i) => reply.get(i + 1).copied().unwrap_or(self.spec.eos),
            None => reply.first().copied().unwrap_or(self.spec.eos),
        }
    }

    fn logits_for(&self, ids: &[u32]) -> Tensor1D {
        let mut logits = vec![0.0; self.spec.vocab_size];
        if let Some(slot) = logits.get_mut(self.next_token(ids) as usize) {
            *slot = 30.0;
        }
        Tensor1D::new(logits)
    }

    fn ids_of(tensor: &Tensor2D) -> Vec<u32> {
        tensor.data.iter().map(|v| v.round() as u32).collect()
    }

    fn is_layer(&self, module: &str) -> bool {
        self.spec
            .layers
            .as_ref()
            .map(|layers| layers.iter().any(|l| l == module))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn family(&self) -> &str {
        "scripted"
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    fn children(&self) -> Vec<String> {
        self.spec.children.iter().map(|(name, _)| name.clone()).collect()
    }

    fn architecture(&self) -> Architecture {
        match &self.spec.layers {
            Some(layers) => Architecture::Decoder(DecoderLayout {
                embeddings: "embed".to_string(),
                pos_embeddings: Some("pos".to_string()),
                layers: layers.clone(),
                final_norm: "norm".to_string(),
                output_projection: "head".to_string(),
            }),
            None => Architecture::Opaque,
        }
    }

    async fn relocate(&mut self, module: &str, device: DeviceRole) -> Result<usize> {
        if !self.spec.relocate_delay.is_zero() {
            tokio::time::sleep(self.spec.relocate_delay).await;
        }
        self.params.relocate(module, device)
    }

    async fn relocate_all(&mut self, device: DeviceRole) -> Result<()> {
        if !self.spec.relocate_all_delay.is_zero() {
            tokio::time::sleep(self.spec.relocate_all_delay).await;
        }
        self.params.relocate_all(device);
        Ok(())
    }

    fn embed(&self, module: &str, indices: &[u32], device: DeviceRole) -> Result<Activation> {
        ensure_on(&self.params, module, device)?;
        let tensor = match module {
            "embed" => Tensor2D::new(indices.iter().map(|&i| i as f32).collect(), 1, indices.len())?,
            "pos" => Tensor2D::zeros(1, indices.len()),
            other => {
                return Err(EngineError::Structure(format!(
                    "'{}' is not an embedding module",
                    other
                )))
            }
        };
        Ok(Activation::new(tensor, device))
    }

    fn forward_module(&self, module: &str, input: Activation) -> Result<Activation> {
        ensure_on(&self.params, module, input.device)?;
        if self.is_layer(module) || module == "norm" {
            return Ok(input);
        }
        if module == "head" {
            let logits = self.logits_for(&Self::ids_of(&input.tensor));
            let cols = logits.len();
            return Ok(Activation::new(Tensor2D::new(logits.data, 1, cols)?, input.device));
        }
        Err(EngineError::Structure(format!("unknown module '{}'", module)))
    }

    fn forward_logits(&self, ids: &[u32], link: &dyn DeviceLink) -> Result<Tensor1D> {
        let tensor = Tensor2D::new(ids.iter().map(|&i| i as f32).collect(), 1, ids.len())?;
        let mut act = Activation::new(tensor, DeviceRole::Primary);

        for (child, numel) in &self.spec.children {
            if *numel == 0 {
                continue;
            }
            let device = self.params.device_of(child).ok_or_else(|| {
                EngineError::Structure(format!("module '{}' is split across devices", child))
            })?;
            act = route(link, act, device)?;
        }

        Ok(self.logits_for(&Self::ids_of(&act.tensor)))
    }

    fn generate(
        &self,
        ids: &[u32],
        params: &GenerationParams,
        eos_token_id: u32,
        link: &dyn DeviceLink,
    ) -> Result<Vec<u32>> {
        let started = Instant::now();
        let sequence = sample_loop(ids, params, eos_token_id, |sequence| {
            self.forward_logits(sequence, link)
        })?;

        if !self.spec.compute_delay.is_zero() {
            std::thread::sleep(self.spec.compute_delay);
        }
        if let Some(log) = &self.spec.log {
            log.record(started, Instant::now());
        }

        Ok(sequence)
    }
}

/// Link whose every copy fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnpluggedLink;

impl DeviceLink for UnpluggedLink {
    fn copy(&self, activation: &Activation, to: DeviceRole) -> Result<Activation> {
        Err(EngineError::Transfer(format!(
            "link down copying {} bytes from {} to {}",
            activation.tensor.byte_len(),
            activation.device,
            to
        )))
    }
}

/// Loader that builds a scripted model with the byte codec, or always fails.
#[derive(Debug, Clone)]
pub struct ScriptedLoader {
    spec: Option<ScriptedSpec>,
}

impl ScriptedLoader {
    pub fn new(spec: ScriptedSpec) -> Self {
        Self { spec: Some(spec) }
    }

    pub fn failing() -> Self {
        Self { spec: None }
    }
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(&self, source: &str) -> Result<LoadedArtifacts> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| EngineError::Load(format!("cannot load '{}'", source)))?;

        Ok(LoadedArtifacts {
            model: Box::new(spec.build()),
            codec: Arc::new(ByteCodec),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HostLink;

    #[test]
    fn test_scripted_reply_then_eos() {
        let model = ScriptedSpec::decoder(2).with_reply("ok").build();
        let params = GenerationParams {
            do_sample: false,
            ..Default::default()
        };
        let prompt: Vec<u32> = b"Q:".iter().map(|&b| u32::from(b)).collect();
        let out = model.generate(&prompt, &params, ByteCodec::EOS, &HostLink).unwrap();
        assert_eq!(&out[2..], &[u32::from(b'o'), u32::from(b'k'), ByteCodec::EOS]);
    }

    #[test]
    fn test_execution_log_overlap() {
        let log = ExecutionLog::default();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);
        let t2 = t0 + Duration::from_millis(20);
        log.record(t0, t1);
        log.record(t1, t2);
        assert!(!log.has_overlap());
        log.record(t0, t2);
        assert!(log.has_overlap());
    }
}
