//! Generation against a placed model.
//!
//! ## Architecture
//!
//! ```text
//! GenerationRequest
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │            InferenceEngine              │
//! │  • Encodes and truncates the prompt     │
//! │  • Serializes access to the model       │
//! │  • Extracts the assistant reply         │
//! └─────────────────────────────────────────┘
//!       │ stage map?
//!       ├── yes ──► PipelinedDecodeLoop ──(error)──┐
//!       │                                          ▼
//!       └── no ───► native generation ◄── relocate to primary
//! ```
//!
//! ## Key Components
//!
//! - [`InferenceEngine`]: Entry point for one loaded model
//! - [`PipelinedDecodeLoop`]: Stage-by-stage greedy decoding across two devices
//! - [`GenerationRequest`] / [`GenerationResult`]: One call and its answer
//! - [`InferenceStats`]: Request and transfer counters

pub mod decode_loop;
pub mod engine;
pub mod request;
pub mod stats;

pub use decode_loop::{DecodeOutput, DecodeState, HaltReason, PipelinedDecodeLoop};
pub use engine::InferenceEngine;
pub use request::{GenerationParams, GenerationRequest, GenerationResult, Prompt};
pub use stats::{InferenceStats, StatsSnapshot};
