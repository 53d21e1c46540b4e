//! Generation request and result types

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sampling parameters for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Hard maximum total sequence length, prompt included
    pub max_length: usize,

    /// Temperature for sampling (lower = more deterministic)
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold
    pub top_p: f32,

    /// Sample from the distribution; `false` means greedy
    pub do_sample: bool,

    /// Seed for the sampling RNG
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 1024,
            temperature: 0.6,
            top_p: 0.9,
            do_sample: true,
            seed: 42,
        }
    }
}

impl GenerationParams {
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            ..Self::default()
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            return Err(EngineError::Config("max_length must be positive".to_string()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::Config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.do_sample && !(self.temperature > 0.0) {
            return Err(EngineError::Config(format!(
                "temperature must be positive when sampling, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Prompt as text or as ids that were tokenized upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    Text(String),
    Tokens(Vec<u32>),
}

/// One call into the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Unique request identifier
    pub id: Uuid,

    pub prompt: Prompt,

    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: Prompt::Text(prompt.into()),
            params: GenerationParams::default(),
        }
    }

    pub fn tokens(ids: Vec<u32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: Prompt::Tokens(ids),
            params: GenerationParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// Generated text plus the raw id sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Request this result answers
    pub request_id: Uuid,

    /// Text after the assistant marker, trimmed
    pub text: String,

    /// Prompt ids followed by generated ids
    pub token_ids: Vec<u32>,

    /// Number of prompt tokens after truncation
    pub prompt_tokens: usize,

    /// Number of generated tokens
    pub completion_tokens: usize,

    /// Wall time in milliseconds
    pub execution_time_ms: u64,
}

impl GenerationResult {
    pub fn tokens_per_second(&self) -> Option<f64> {
        (self.execution_time_ms > 0)
            .then(|| self.completion_tokens as f64 / (self.execution_time_ms as f64 / 1000.0))
    }
}
