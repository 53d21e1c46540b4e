//! Text ⇄ token id codecs.

use crate::errors::{EngineError, Result};
use std::path::Path;

/// Opaque tokenizer supplied with the model.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

/// One token per byte, plus an end-of-sequence id right after the byte range.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteCodec;

impl ByteCodec {
    pub const EOS: u32 = 256;
}

impl TokenCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> u32 {
        Self::EOS
    }

    fn vocab_size(&self) -> usize {
        Self::EOS as usize + 1
    }
}

/// Candidate end-of-sequence tokens, tried in order when the model config names none.
const EOS_CANDIDATES: [&str; 3] = ["<|endoftext|>", "</s>", "<eos>"];

/// Hugging Face `tokenizer.json` codec
pub struct HfTokenizerCodec {
    inner: tokenizers::Tokenizer,
    eos: u32,
}

impl HfTokenizerCodec {
    pub fn from_file(path: &Path, eos_hint: Option<u32>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| EngineError::Load(format!("tokenizer {}: {}", path.display(), e)))?;

        let eos = eos_hint
            .or_else(|| EOS_CANDIDATES.iter().find_map(|t| inner.token_to_id(t)))
            .ok_or_else(|| {
                EngineError::Load(format!(
                    "tokenizer {} defines no end-of-sequence token",
                    path.display()
                ))
            })?;

        Ok(Self { inner, eos })
    }
}

impl TokenCodec for HfTokenizerCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EngineError::Generation(format!("tokenization failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| EngineError::Generation(format!("detokenization failed: {}", e)))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
