use super::{
    DecodeOutput, GenerationParams, GenerationRequest, GenerationResult, InferenceStats,
    PipelinedDecodeLoop, Prompt,
};
use crate::config::PromptSettings;
use crate::device::DeviceRole;
use crate::errors::{EngineError, Result};
use crate::model::{DeviceLink, ModelHandle, TokenCodec};
use crate::strategy::PipelineStageMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn, Span};

/// Runs generation against a placed model.
///
/// Forward passes run on tokio's blocking pool while the request holds the
/// model lock. With a stage map the pipelined decode loop is tried first; any
/// failure in it moves the whole model to the primary device and reruns the
/// request through the model's own generation routine. After such a fallback the stage map no
/// longer matches the placement, so later requests go straight to the
/// single-device path.
pub struct InferenceEngine {
    model: Arc<Mutex<ModelHandle>>,
    codec: Arc<dyn TokenCodec>,
    link: Arc<dyn DeviceLink>,
    stage_map: Option<Arc<PipelineStageMap>>,
    prompt: PromptSettings,
    stats: Arc<InferenceStats>,
    pipeline_degraded: AtomicBool,
}

impl InferenceEngine {
    pub fn new(
        model: ModelHandle,
        codec: Arc<dyn TokenCodec>,
        link: Arc<dyn DeviceLink>,
        stage_map: Option<PipelineStageMap>,
        prompt: PromptSettings,
        stats: Arc<InferenceStats>,
    ) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            codec,
            link,
            stage_map: stage_map.map(Arc::new),
            prompt,
            stats,
            pipeline_degraded: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> &Arc<InferenceStats> {
        &self.stats
    }

    pub fn stage_map(&self) -> Option<&PipelineStageMap> {
        self.stage_map.as_deref()
    }

    /// Whether the next request will use the pipelined loop.
    pub fn is_pipelined(&self) -> bool {
        self.stage_map.is_some() && !self.pipeline_degraded.load(Ordering::Acquire)
    }

    #[instrument(skip(self, request), fields(request_id = %request.id))]
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let started = Instant::now();

        match self.generate_inner(request, started).await {
            Ok(result) => {
                self.stats.record_success(
                    result.prompt_tokens,
                    result.completion_tokens,
                    result.execution_time_ms,
                );
                info!(
                    prompt_tokens = result.prompt_tokens,
                    completion_tokens = result.completion_tokens,
                    time_ms = result.execution_time_ms,
                    "Generation complete"
                );
                Ok(result)
            }
            Err(e) => {
                self.stats.record_failure();
                warn!(error = %e, "Generation failed");
                Err(e)
            }
        }
    }

    async fn generate_inner(
        &self,
        request: &GenerationRequest,
        started: Instant,
    ) -> Result<GenerationResult> {
        request.params.validate()?;
        let ids = self.prepare_input(&request.prompt)?;
        let prompt_tokens = ids.len();

        let model = Arc::clone(&self.model).lock_owned().await;
        let sequence = self.run(model, ids, request.params.clone()).await?;

        let completion_tokens = sequence.len().saturating_sub(prompt_tokens);
        let text = self.extract_reply(&sequence)?;

        Ok(GenerationResult {
            request_id: request.id,
            text,
            token_ids: sequence,
            prompt_tokens,
            completion_tokens,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Encode and truncate to the configured input budget, keeping the head.
    fn prepare_input(&self, prompt: &Prompt) -> Result<Vec<u32>> {
        let mut ids = match prompt {
            Prompt::Text(text) => self.codec.encode(text)?,
            Prompt::Tokens(ids) => ids.clone(),
        };

        if ids.is_empty() {
            return Err(EngineError::Generation("prompt encodes to no tokens".to_string()));
        }

        if ids.len() > self.prompt.max_input_tokens {
            warn!(
                tokens = ids.len(),
                limit = self.prompt.max_input_tokens,
                "Truncating prompt"
            );
            ids.truncate(self.prompt.max_input_tokens);
        }

        Ok(ids)
    }

    async fn run(
        &self,
        model: OwnedMutexGuard<ModelHandle>,
        ids: Vec<u32>,
        params: GenerationParams,
    ) -> Result<Vec<u32>> {
        let stage_map = match &self.stage_map {
            Some(map) if !self.pipeline_degraded.load(Ordering::Acquire) => Arc::clone(map),
            _ => return self.run_native(model, ids, params).await,
        };

        let (mut model, decoded) = self
            .run_pipelined(model, stage_map, ids.clone(), params.max_length)
            .await?;

        match decoded {
            Ok(output) => {
                debug!(steps = output.steps, halt = ?output.halt, "Pipelined decode finished");
                Ok(output.sequence)
            }
            Err(e) => {
                warn!(error = %e, "Pipelined decode failed, falling back to primary device");
                self.stats.record_fallback();
                model.relocate_all(DeviceRole::Primary).await?;
                self.pipeline_degraded.store(true, Ordering::Release);
                self.run_native(model, ids, params).await
            }
        }
    }

    /// Decode on the blocking pool. The guard comes back so a failed run can
    /// relocate the model before falling back.
    async fn run_pipelined(
        &self,
        model: OwnedMutexGuard<ModelHandle>,
        stage_map: Arc<PipelineStageMap>,
        ids: Vec<u32>,
        max_length: usize,
    ) -> Result<(OwnedMutexGuard<ModelHandle>, Result<DecodeOutput>)> {
        let link = Arc::clone(&self.link);
        let stats = Arc::clone(&self.stats);
        let eos_token_id = self.codec.eos_token_id();
        let span = Span::current();

        tokio::task::spawn_blocking(move || {
            let decoded = span.in_scope(|| {
                PipelinedDecodeLoop::new(
                    model.model(),
                    &stage_map,
                    link.as_ref(),
                    &stats,
                    eos_token_id,
                    max_length,
                )
                .and_then(|decode| decode.run(&ids))
            });
            (model, decoded)
        })
        .await
        .map_err(|e| EngineError::Generation(format!("decode task failed: {}", e)))
    }

    async fn run_native(
        &self,
        model: OwnedMutexGuard<ModelHandle>,
        ids: Vec<u32>,
        params: GenerationParams,
    ) -> Result<Vec<u32>> {
        let link = Arc::clone(&self.link);
        let eos_token_id = self.codec.eos_token_id();
        let span = Span::current();

        tokio::task::spawn_blocking(move || {
            span.in_scope(|| {
                model
                    .model()
                    .generate(&ids, &params, eos_token_id, link.as_ref())
            })
        })
        .await
        .map_err(|e| EngineError::Generation(format!("generation task failed: {}", e)))?
    }

    /// Decode and keep the text after the first assistant marker.
    fn extract_reply(&self, sequence: &[u32]) -> Result<String> {
        let decoded = self.codec.decode(sequence)?;
        let marker = self.prompt.assistant_marker.as_str();

        let reply = match decoded.find(marker) {
            Some(pos) if !marker.is_empty() => &decoded[pos + marker.len()..],
            _ => decoded.as_str(),
        };

        Ok(reply.trim().to_string())
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("pipelined", &self.is_pipelined())
            .field("prompt", &self.prompt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DevicePair, DeviceProfile};
    use crate::model::mock::{ScriptedSpec, UnpluggedLink};
    use crate::model::{ByteCodec, HostLink};
    use crate::strategy::{DistributionStrategy, Placement, PipelineParallel, StageName};
    use std::time::Duration;

    fn devices() -> DevicePair {
        DevicePair::new(
            DeviceProfile::new(DeviceRole::Primary, DeviceKind::Npu, 0.5).unwrap(),
            DeviceProfile::new(DeviceRole::Secondary, DeviceKind::Cpu, 0.5).unwrap(),
        )
        .unwrap()
    }

    async fn engine(spec: ScriptedSpec, link: Arc<dyn DeviceLink>, pipelined: bool) -> InferenceEngine {
        let mut model = spec.handle();
        let stage_map = if pipelined {
            PipelineParallel.apply(&mut model, &devices()).await.unwrap().stage_map
        } else {
            None
        };
        InferenceEngine::new(
            model,
            Arc::new(ByteCodec),
            link,
            stage_map,
            PromptSettings::default(),
            Arc::new(InferenceStats::new()),
        )
    }

    #[tokio::test]
    async fn test_reply_after_marker() {
        let engine = engine(ScriptedSpec::decoder(4).with_reply(" hi"), Arc::new(HostLink), true).await;
        let request = GenerationRequest::text("User: test\nAssistant:");

        let result = engine.generate(&request).await.unwrap();

        assert_eq!(result.text, "hi");
        assert_eq!(result.request_id, request.id);
        assert_eq!(result.prompt_tokens, 21);
        assert_eq!(result.completion_tokens, 4);
        assert!(engine.is_pipelined());
    }

    #[tokio::test]
    async fn test_no_marker_returns_full_text() {
        let engine = engine(ScriptedSpec::decoder(2).with_reply(" ok"), Arc::new(HostLink), false).await;
        let result = engine.generate(&GenerationRequest::text("say")).await.unwrap();
        assert_eq!(result.text, "say ok");
    }

    #[tokio::test]
    async fn test_transfer_failure_falls_back() {
        let engine = engine(ScriptedSpec::decoder(4), Arc::new(UnpluggedLink), true).await;

        let result = engine
            .generate(&GenerationRequest::text("User: test\nAssistant:"))
            .await
            .unwrap();

        assert_eq!(result.text, "ok");
        assert!(!engine.is_pipelined());
        assert_eq!(engine.stats().snapshot().pipeline_fallbacks, 1);

        let model = engine.model.lock().await;
        assert_eq!(Placement::of(&model), Placement::Single(DeviceRole::Primary));
    }

    #[tokio::test]
    async fn test_degraded_engine_skips_pipeline() {
        let engine = engine(ScriptedSpec::decoder(4), Arc::new(UnpluggedLink), true).await;
        let request = GenerationRequest::text("User: a\nAssistant:");

        engine.generate(&request).await.unwrap();
        engine.generate(&request).await.unwrap();

        assert_eq!(engine.stats().snapshot().pipeline_fallbacks, 1);
        assert_eq!(engine.stats().snapshot().requests_completed, 2);
    }

    #[tokio::test]
    async fn test_prompt_truncated_to_head() {
        let mut engine = engine(ScriptedSpec::decoder(2), Arc::new(HostLink), false).await;
        engine.prompt.max_input_tokens = 4;

        let result = engine
            .generate(&GenerationRequest::tokens(vec![65, 66, 67, 68, 69, 70]))
            .await
            .unwrap();

        assert_eq!(result.prompt_tokens, 4);
        assert_eq!(&result.token_ids[..4], &[65, 66, 67, 68]);
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let engine = engine(ScriptedSpec::decoder(2), Arc::new(HostLink), false).await;
        let err = engine.generate(&GenerationRequest::text("")).await.unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));
        assert_eq!(engine.stats().snapshot().requests_failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected() {
        let engine = engine(ScriptedSpec::decoder(2), Arc::new(HostLink), false).await;
        let request =
            GenerationRequest::text("x").with_params(GenerationParams::default().with_max_length(0));
        assert!(matches!(
            engine.generate(&request).await,
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_no_layers_decodes_pipelined() {
        let engine = engine(ScriptedSpec::decoder(0).with_reply("z"), Arc::new(HostLink), true).await;
        let map = engine.stage_map().unwrap();
        assert!(map.require(StageName::EarlyLayers).unwrap().modules.is_empty());
        assert!(map.require(StageName::LateLayers).unwrap().modules.is_empty());

        let result = engine.generate(&GenerationRequest::text("q")).await.unwrap();

        assert_eq!(result.text, "qz");
        assert!(engine.is_pipelined());
        assert_eq!(engine.stats().snapshot().pipeline_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_generation_leaves_runtime_responsive() {
        let spec = ScriptedSpec::decoder(2).with_compute_delay(Duration::from_millis(300));
        let engine = Arc::new(engine(spec, Arc::new(HostLink), false).await);

        let worker = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.generate(&GenerationRequest::text("q")).await })
        };

        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waited = started.elapsed();

        worker.await.unwrap().unwrap();
        assert!(waited < Duration::from_millis(150), "timer stalled for {:?}", waited);
    }
}
