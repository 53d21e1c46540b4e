//! Pipelined decode loop for a model split across two devices.
//!
//! ## Step flow
//!
//! ```text
//! ids (primary)
//!    │
//!    ▼
//! Embedding ──► EarlyLayers ──► CrossDeviceTransfer ──► LateLayers
//!  (primary)     (primary)       (primary → secondary)   (secondary)
//!                                                            │
//!    ┌───────────────────────────────────────────────────────┘
//!    ▼
//! OutputProjection ──► TokenSelection ──► Continue ──► Embedding
//!   (secondary)          (argmax)    └──► Halt (eos or max length)
//! ```
//!
//! Every step re-embeds and re-runs the whole prefix. There is no per-layer
//! key/value cache. Token selection is always greedy, whatever sampling the
//! single-device path uses.

use super::InferenceStats;
use crate::errors::{EngineError, Result};
use crate::model::{route, Activation, DeviceLink, LanguageModel};
use crate::strategy::{PipelineStage, PipelineStageMap, StageName};
use crate::tensor_ops::{sample_greedy, Tensor1D};
use std::time::Instant;
use tracing::{debug, trace};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    EndOfSequence,
    MaxLength,
}

/// One state of the per-token machine. Payloads carry the data flowing
/// between states.
#[derive(Debug)]
pub enum DecodeState {
    Embedding,
    EarlyLayers(Activation),
    CrossDeviceTransfer(Activation),
    LateLayers(Activation),
    OutputProjection(Activation),
    TokenSelection(Tensor1D),
    Continue,
    Halt(HaltReason),
}

impl DecodeState {
    pub fn name(&self) -> &'static str {
        match self {
            DecodeState::Embedding => "embedding",
            DecodeState::EarlyLayers(_) => "early_layers",
            DecodeState::CrossDeviceTransfer(_) => "cross_device_transfer",
            DecodeState::LateLayers(_) => "late_layers",
            DecodeState::OutputProjection(_) => "output_projection",
            DecodeState::TokenSelection(_) => "token_selection",
            DecodeState::Continue => "continue",
            DecodeState::Halt(_) => "halt",
        }
    }
}

/// Ids produced by one run of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOutput {
    /// Prompt followed by generated ids
    pub sequence: Vec<u32>,
    /// Tokens appended
    pub steps: usize,
    pub halt: HaltReason,
}

/// Drives a model stage by stage according to a stage map.
pub struct PipelinedDecodeLoop<'a> {
    model: &'a dyn LanguageModel,
    link: &'a dyn DeviceLink,
    stats: &'a InferenceStats,
    embeddings: &'a PipelineStage,
    pos_embeddings: Option<&'a PipelineStage>,
    early: &'a PipelineStage,
    late: &'a PipelineStage,
    head: &'a PipelineStage,
    projection: Option<&'a PipelineStage>,
    eos_token_id: u32,
    max_length: usize,
}

impl<'a> PipelinedDecodeLoop<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        stage_map: &'a PipelineStageMap,
        link: &'a dyn DeviceLink,
        stats: &'a InferenceStats,
        eos_token_id: u32,
        max_length: usize,
    ) -> Result<Self> {
        Ok(Self {
            model,
            link,
            stats,
            embeddings: stage_map.require(StageName::Embeddings)?,
            pos_embeddings: stage_map.stage(StageName::PosEmbeddings),
            early: stage_map.require(StageName::EarlyLayers)?,
            late: stage_map.require(StageName::LateLayers)?,
            head: stage_map.require(StageName::OutputHead)?,
            projection: stage_map.stage(StageName::OutputProjection),
            eos_token_id,
            max_length,
        })
    }

    /// Run until the end-of-sequence id or `max_length` total ids.
    ///
    /// Any error aborts the run; the caller owns the fallback.
    pub fn run(&self, ids: &[u32]) -> Result<DecodeOutput> {
        if ids.is_empty() {
            return Err(EngineError::Tensor("empty input sequence".to_string()));
        }

        let mut sequence = ids.to_vec();
        if sequence.len() >= self.max_length {
            return Ok(DecodeOutput {
                sequence,
                steps: 0,
                halt: HaltReason::MaxLength,
            });
        }

        let mut state = DecodeState::Embedding;
        loop {
            trace!(state = state.name(), len = sequence.len(), "Decode state");
            state = match state {
                DecodeState::Halt(halt) => {
                    return Ok(DecodeOutput {
                        steps: sequence.len() - ids.len(),
                        sequence,
                        halt,
                    });
                }
                DecodeState::Continue => DecodeState::Embedding,
                other => self.advance(other, &mut sequence)?,
            };
        }
    }

    /// Execute one state and return the next.
    pub fn advance(&self, state: DecodeState, sequence: &mut Vec<u32>) -> Result<DecodeState> {
        match state {
            DecodeState::Embedding => self.embed(sequence).map(DecodeState::EarlyLayers),
            DecodeState::EarlyLayers(act) => {
                let act = route(self.link, act, self.early.device)?;
                self.run_stage(self.early, act)
                    .map(DecodeState::CrossDeviceTransfer)
            }
            DecodeState::CrossDeviceTransfer(act) => {
                self.transfer(act).map(DecodeState::LateLayers)
            }
            DecodeState::LateLayers(act) => {
                self.run_stage(self.late, act).map(DecodeState::OutputProjection)
            }
            DecodeState::OutputProjection(act) => {
                self.project(act).map(DecodeState::TokenSelection)
            }
            DecodeState::TokenSelection(logits) => {
                let next = sample_greedy(&logits);
                sequence.push(next);
                self.stats.record_step();
                debug!(token = next, len = sequence.len(), "Selected token");

                if next == self.eos_token_id {
                    Ok(DecodeState::Halt(HaltReason::EndOfSequence))
                } else if sequence.len() >= self.max_length {
                    Ok(DecodeState::Halt(HaltReason::MaxLength))
                } else {
                    Ok(DecodeState::Continue)
                }
            }
            DecodeState::Continue => Ok(DecodeState::Embedding),
            DecodeState::Halt(reason) => Ok(DecodeState::Halt(reason)),
        }
    }

    fn embed(&self, sequence: &[u32]) -> Result<Activation> {
        let module = self.embeddings.modules.first().ok_or_else(|| {
            EngineError::Structure("embeddings stage has no module".to_string())
        })?;
        let mut hidden = self.model.embed(module, sequence, self.embeddings.device)?;

        if let Some(stage) = self.pos_embeddings {
            let positions: Vec<u32> = (0..sequence.len() as u32).collect();
            for module in &stage.modules {
                let pos = self.model.embed(module, &positions, stage.device)?;
                let pos = route(self.link, pos, hidden.device)?;
                hidden = Activation::new(hidden.tensor.add(&pos.tensor)?, hidden.device);
            }
        }

        Ok(hidden)
    }

    fn run_stage(&self, stage: &PipelineStage, mut act: Activation) -> Result<Activation> {
        for module in &stage.modules {
            act = self.model.forward_module(module, act)?;
        }
        Ok(act)
    }

    /// Blocking copy of the hidden state to the late-stage device.
    /// A no-op when the activation already lives there.
    fn transfer(&self, act: Activation) -> Result<Activation> {
        let target = self.late.device;
        if act.device == target {
            return Ok(act);
        }

        let bytes = act.tensor.byte_len();
        let started = Instant::now();
        let moved = self.link.copy(&act, target)?;
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.stats.record_transfer(bytes, elapsed_us);

        debug!(
            from = %act.device,
            to = %target,
            bytes,
            elapsed_us,
            "Hidden state transferred"
        );
        Ok(moved)
    }

    /// Output head over the full sequence, then the projection on the last position.
    fn project(&self, act: Activation) -> Result<Tensor1D> {
        let act = route(self.link, act, self.head.device)?;
        let act = self.run_stage(self.head, act)?;
        let mut last = Activation::new(act.tensor.last_row()?, act.device);

        if let Some(stage) = self.projection {
            last = route(self.link, last, stage.device)?;
            last = self.run_stage(stage, last)?;
        }

        Ok(Tensor1D::new(last.tensor.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DevicePair, DeviceProfile, DeviceRole};
    use crate::inference::GenerationParams;
    use crate::model::mock::{ScriptedSpec, UnpluggedLink};
    use crate::model::{ByteCodec, DecoderConfig, HostLink, ModelHandle, ReferenceDecoder};
    use crate::strategy::{DistributionStrategy, PipelineParallel};
    use std::time::Duration;

    fn devices(primary_weight: f64) -> DevicePair {
        DevicePair::new(
            DeviceProfile::new(DeviceRole::Primary, DeviceKind::Npu, primary_weight).unwrap(),
            DeviceProfile::new(DeviceRole::Secondary, DeviceKind::Cuda, 0.5).unwrap(),
        )
        .unwrap()
    }

    async fn pipelined(mut model: ModelHandle, weight: f64) -> (ModelHandle, PipelineStageMap) {
        let outcome = PipelineParallel.apply(&mut model, &devices(weight)).await.unwrap();
        (model, outcome.stage_map.unwrap())
    }

    fn tiny_decoder() -> ModelHandle {
        decoder_with_layers(4)
    }

    fn decoder_with_layers(n_layer: usize) -> ModelHandle {
        let config = DecoderConfig {
            vocab_size: 32,
            n_positions: 32,
            n_embd: 8,
            n_layer,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
            eos_token_id: Some(31),
        };
        let decoder = ReferenceDecoder::seeded(config, 7).unwrap();
        ModelHandle::new(Box::new(decoder), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_scripted_reply_through_stages() {
        let spec = ScriptedSpec::decoder(4).with_reply(" ok");
        let (model, map) = pipelined(spec.handle(), 0.5).await;
        let stats = InferenceStats::new();

        let decode =
            PipelinedDecodeLoop::new(model.model(), &map, &HostLink, &stats, ByteCodec::EOS, 64)
                .unwrap();
        let prompt: Vec<u32> = b"A:".iter().map(|&b| u32::from(b)).collect();
        let out = decode.run(&prompt).unwrap();

        assert_eq!(out.halt, HaltReason::EndOfSequence);
        assert_eq!(&out.sequence[2..], &[32, u32::from(b'o'), u32::from(b'k'), ByteCodec::EOS]);
        assert_eq!(out.steps, 4);
        assert_eq!(stats.snapshot().cross_device_transfers, 4);
    }

    #[tokio::test]
    async fn test_matches_native_greedy_generation() {
        let (model, map) = pipelined(tiny_decoder(), 0.5).await;
        let stats = InferenceStats::new();
        let prompt = vec![1, 5, 9, 2];

        let decode =
            PipelinedDecodeLoop::new(model.model(), &map, &HostLink, &stats, 31, 16).unwrap();
        let pipelined = decode.run(&prompt).unwrap();

        let params = GenerationParams::greedy().with_max_length(16);
        let native = model.model().generate(&prompt, &params, 31, &HostLink).unwrap();

        assert_eq!(pipelined.sequence, native);
    }

    #[tokio::test]
    async fn test_halts_within_max_length() {
        // Reply never finishes before the limit.
        let spec = ScriptedSpec::decoder(2).with_reply("abcdefghijklmnop");
        let (model, map) = pipelined(spec.handle(), 0.5).await;
        let stats = InferenceStats::new();

        let decode =
            PipelinedDecodeLoop::new(model.model(), &map, &HostLink, &stats, ByteCodec::EOS, 8)
                .unwrap();
        let out = decode.run(&[u32::from(b':')]).unwrap();

        assert_eq!(out.halt, HaltReason::MaxLength);
        assert_eq!(out.sequence.len(), 8);
        assert!(out.steps <= 8);
    }

    #[tokio::test]
    async fn test_prompt_at_limit_does_nothing() {
        let (model, map) = pipelined(ScriptedSpec::decoder(2).handle(), 0.5).await;
        let stats = InferenceStats::new();
        let decode =
            PipelinedDecodeLoop::new(model.model(), &map, &HostLink, &stats, ByteCodec::EOS, 3)
                .unwrap();

        let out = decode.run(&[1, 2, 3]).unwrap();
        assert_eq!(out.steps, 0);
        assert_eq!(out.sequence, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_all_layers_on_primary_still_decodes() {
        let spec = ScriptedSpec::decoder(3).with_reply("x");
        let (model, map) = pipelined(spec.handle(), 1.0).await;
        let stats = InferenceStats::new();

        let decode =
            PipelinedDecodeLoop::new(model.model(), &map, &HostLink, &stats, ByteCodec::EOS, 32)
                .unwrap();
        let out = decode.run(&[u32::from(b'?')]).unwrap();

        assert_eq!(out.sequence, vec![u32::from(b'?'), u32::from(b'x'), ByteCodec::EOS]);
    }

    #[tokio::test]
    async fn test_no_layers_matches_native_greedy() {
        let (model, map) = pipelined(decoder_with_layers(0), 0.5).await;
        assert!(map.require(StageName::EarlyLayers).unwrap().modules.is_empty());
        assert!(map.require(StageName::LateLayers).unwrap().modules.is_empty());
        let stats = InferenceStats::new();
        let prompt = vec![3, 4];

        let decode =
            PipelinedDecodeLoop::new(model.model(), &map, &HostLink, &stats, 31, 12).unwrap();
        let pipelined = decode.run(&prompt).unwrap();

        let params = GenerationParams::greedy().with_max_length(12);
        let native = model.model().generate(&prompt, &params, 31, &HostLink).unwrap();

        assert_eq!(pipelined.sequence, native);
        assert!(pipelined.steps > 0);
    }

    #[tokio::test]
    async fn test_transfer_failure_aborts() {
        let (model, map) = pipelined(ScriptedSpec::decoder(4).handle(), 0.5).await;
        let stats = InferenceStats::new();

        let decode =
            PipelinedDecodeLoop::new(model.model(), &map, &UnpluggedLink, &stats, ByteCodec::EOS, 32)
                .unwrap();
        let err = decode.run(&[1]).unwrap_err();

        assert!(matches!(err, EngineError::Transfer(_)));
        assert_eq!(stats.snapshot().decode_steps, 0);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(DecodeState::Embedding.name(), "embedding");
        assert_eq!(DecodeState::Halt(HaltReason::MaxLength).name(), "halt");
    }
}
