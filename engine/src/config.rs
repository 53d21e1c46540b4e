//! Engine configuration.
//!
//! Stored as TOML at `~/.hetero/engine.toml`. Every section has defaults, so a
//! missing file or a partial file both produce a usable configuration.

use crate::device::DeviceKind;
use crate::errors::{EngineError, Result};
use crate::inference::GenerationParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Model directory used when neither the file nor `MODEL_PATH` names one:
/// `~/.hetero/models/default`. Falls back to a relative path without a home directory.
pub fn default_model_path() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hetero")
        .join("models")
        .join("default")
        .to_string_lossy()
        .into_owned()
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Model directory (config.json, model.safetensors, tokenizer.json)
    pub model_path: String,

    /// Device weights and optional forced device kinds
    pub devices: DeviceSettings,

    /// Strategy selection policy
    pub policy: PolicySettings,

    /// Default generation parameters for requests that bring none
    pub generation: GenerationParams,

    /// Prompt handling
    pub prompt: PromptSettings,

    /// Timeouts and concurrency policy
    pub runtime: RuntimeSettings,

    /// Logging setup
    pub logging: LoggingSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            devices: DeviceSettings::default(),
            policy: PolicySettings::default(),
            generation: GenerationParams::default(),
            prompt: PromptSettings::default(),
            runtime: RuntimeSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// Share of work for the primary device
    pub primary_weight: f64,

    /// Share of work for the secondary device
    pub secondary_weight: f64,

    /// Force the primary kind instead of probing
    pub primary: Option<DeviceKind>,

    /// Force the secondary kind instead of probing
    pub secondary: Option<DeviceKind>,

    /// Override bytes-per-parameter for size estimation
    pub bytes_per_param: Option<u32>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            primary_weight: 0.85,
            secondary_weight: 0.15,
            primary: None,
            secondary: None,
            bytes_per_param: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicySettings {
    /// Footprint above which an accelerator primary gets ModelParallel
    pub large_model_threshold_gb: f64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            large_model_threshold_gb: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromptSettings {
    /// Prompts are truncated to this many tokens, keeping the head
    pub max_input_tokens: usize,

    /// Only the text after the first occurrence of this marker is returned
    pub assistant_marker: String,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            max_input_tokens: 1024,
            assistant_marker: "Assistant:".to_string(),
        }
    }
}

/// What a generation call does while another one is in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait up to `timeout_ms` for the running generation to finish
    Queue { timeout_ms: u64 },
    /// Fail immediately with a busy error
    Reject,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        BusyPolicy::Queue { timeout_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Upper bound for a single module relocation
    pub relocation_timeout_ms: u64,

    pub busy_policy: BusyPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            relocation_timeout_ms: 30_000,
            busy_policy: BusyPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,

    /// Defaults to `~/.hetero/logs`
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Get default configuration file path: `~/.hetero/engine.toml`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if the home directory cannot be determined.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".hetero").join("engine.toml"))
    }

    /// Save configuration to file.
    ///
    /// Creates parent directories and writes through a temp file + rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Engine configuration saved");
        Ok(())
    }

    /// Load and validate configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to read config file"
            );
            e
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            model_path = %config.model_path,
            "Engine configuration loaded"
        );

        Ok(config)
    }

    /// Load from `path` if it exists, otherwise defaults, then apply environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `MODEL_PATH` replaces the configured model path when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("MODEL_PATH") {
            if !path.trim().is_empty() {
                tracing::debug!(model_path = %path, "MODEL_PATH override");
                self.model_path = path;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("primary_weight", self.devices.primary_weight),
            ("secondary_weight", self.devices.secondary_weight),
        ] {
            if !(weight > 0.0 && weight <= 1.0) {
                return Err(EngineError::Config(format!(
                    "devices.{} must be in (0, 1], got {}",
                    name, weight
                )));
            }
        }

        if self.devices.bytes_per_param == Some(0) {
            return Err(EngineError::Config(
                "devices.bytes_per_param must be positive".to_string(),
            ));
        }

        if !(self.policy.large_model_threshold_gb > 0.0) {
            return Err(EngineError::Config(format!(
                "policy.large_model_threshold_gb must be positive, got {}",
                self.policy.large_model_threshold_gb
            )));
        }

        self.generation.validate()?;

        if self.prompt.max_input_tokens == 0 {
            return Err(EngineError::Config(
                "prompt.max_input_tokens must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
