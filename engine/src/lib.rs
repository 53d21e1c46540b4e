pub mod config;
pub mod device;
pub mod errors;
pub mod inference;
pub mod manager;
pub mod model;
pub mod observability;
pub mod strategy;
pub mod tensor_ops;

pub use config::EngineConfig;
pub use device::{DeviceKind, DevicePair, DeviceProfile, DeviceRole, HardwareInventory};
pub use errors::{EngineError, Result};
pub use inference::{GenerationParams, GenerationRequest, GenerationResult, InferenceEngine};
pub use manager::{ManagerStatus, ModelManager};
pub use model::{LanguageModel, ModelHandle, ModelLoader, TokenCodec};
pub use strategy::{DistributionOutcome, DistributionStrategy, PipelineStageMap, StrategyKind};
