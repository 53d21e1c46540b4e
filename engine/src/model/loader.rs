use super::{ByteCodec, DecoderConfig, HfTokenizerCodec, LanguageModel, ReferenceDecoder, TokenCodec};
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// What a loader hands back: the model and the codec that goes with it.
pub struct LoadedArtifacts {
    pub model: Box<dyn LanguageModel>,
    pub codec: Arc<dyn TokenCodec>,
}

/// Turns a model identifier into a model plus codec.
///
/// Every failure is a load error.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, source: &str) -> Result<LoadedArtifacts>;
}

/// Loads the GPT-2 family from a checkpoint directory.
///
/// Expects `config.json`; `model.safetensors` and `tokenizer.json` are optional.
/// Without weights the model is seeded deterministically, without a tokenizer
/// the byte codec is used.
#[derive(Debug, Clone)]
pub struct ReferenceLoader {
    seed: u64,
}

impl Default for ReferenceLoader {
    fn default() -> Self {
        Self { seed: 0x5EED }
    }
}

impl ReferenceLoader {
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

#[async_trait]
impl ModelLoader for ReferenceLoader {
    #[tracing::instrument(skip(self))]
    async fn load(&self, source: &str) -> Result<LoadedArtifacts> {
        let dir = Path::new(source);
        if !dir.is_dir() {
            return Err(EngineError::Load(format!(
                "model directory '{}' not found",
                source
            )));
        }

        let config_path = dir.join("config.json");
        let raw = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| EngineError::Load(format!("{}: {}", config_path.display(), e)))?;
        let config: DecoderConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Load(format!("{}: {}", config_path.display(), e)))?;

        let tokenizer_path = dir.join("tokenizer.json");
        let codec: Arc<dyn TokenCodec> = if tokenizer_path.exists() {
            Arc::new(HfTokenizerCodec::from_file(&tokenizer_path, config.eos_token_id)?)
        } else {
            tracing::warn!(dir = %dir.display(), "No tokenizer.json, using byte codec");
            Arc::new(ByteCodec)
        };

        if codec.vocab_size() > config.vocab_size {
            return Err(EngineError::Load(format!(
                "tokenizer vocabulary {} exceeds model vocabulary {}",
                codec.vocab_size(),
                config.vocab_size
            )));
        }

        let weights_path = dir.join("model.safetensors");
        let model = if weights_path.exists() {
            let bytes = tokio::fs::read(&weights_path)
                .await
                .map_err(|e| EngineError::Load(format!("{}: {}", weights_path.display(), e)))?;
            ReferenceDecoder::from_safetensors(config, &bytes)?
        } else {
            tracing::warn!(
                dir = %dir.display(),
                seed = self.seed,
                "No model.safetensors, using seeded weights"
            );
            ReferenceDecoder::seeded(config, self.seed)?
        };

        tracing::info!(
            family = model.family(),
            parameters = model.parameters().parameter_count(),
            layers = model.config().n_layer,
            "Model artifacts loaded"
        );

        Ok(LoadedArtifacts {
            model: Box::new(model),
            codec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &Path) {
        let config = serde_json::json!({
            "vocab_size": 257,
            "n_positions": 64,
            "n_embd": 8,
            "n_layer": 2,
            "n_head": 2
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_load_error() {
        let result = ReferenceLoader::default().load("/nonexistent/model").await;
        assert!(matches!(result, Err(EngineError::Load(_))));
    }

    #[tokio::test]
    async fn test_config_only_uses_seeded_weights_and_byte_codec() {
        let temp_dir = TempDir::new().unwrap();
        write_config(temp_dir.path());

        let artifacts = ReferenceLoader::default()
            .load(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(artifacts.model.family(), "gpt2");
        assert_eq!(artifacts.codec.eos_token_id(), ByteCodec::EOS);
    }

    #[tokio::test]
    async fn test_loads_safetensors_weights() {
        let temp_dir = TempDir::new().unwrap();
        write_config(temp_dir.path());

        let raw = std::fs::read_to_string(temp_dir.path().join("config.json")).unwrap();
        let config: DecoderConfig = serde_json::from_str(&raw).unwrap();
        let source = ReferenceDecoder::seeded(config, 77).unwrap();
        std::fs::write(
            temp_dir.path().join("model.safetensors"),
            source.to_safetensors().unwrap(),
        )
        .unwrap();

        // A loader with a different seed must still reproduce the stored weights.
        let artifacts = ReferenceLoader::with_seed(1)
            .load(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        let link = crate::model::HostLink;
        let expected = source.forward_logits(&[10, 20], &link).unwrap();
        let actual = artifacts.model.forward_logits(&[10, 20], &link).unwrap();
        assert_eq!(expected, actual);
    }

    #[tokio::test]
    async fn test_vocab_smaller_than_codec_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = serde_json::json!({
            "vocab_size": 100,
            "n_positions": 16,
            "n_embd": 4,
            "n_layer": 1,
            "n_head": 1
        });
        std::fs::write(temp_dir.path().join("config.json"), config.to_string()).unwrap();

        let result = ReferenceLoader::default()
            .load(temp_dir.path().to_str().unwrap())
            .await;
        assert!(matches!(result, Err(EngineError::Load(_))));
    }
}
