use thiserror::Error;

/// Errors that can occur while loading, placing, or running a model.
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error occurred (config files, model artifacts, logs)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model or codec could not be loaded. Fatal to the manager.
    #[error("Load error: {0}")]
    Load(String),

    /// Generation was requested before a model was loaded
    #[error("Model not loaded")]
    NotLoaded,

    /// A single sub-module could not be moved to the target device
    #[error("Relocation of '{module}' failed: {reason}")]
    Relocation { module: String, reason: String },

    /// The model lacks the shape an operation expects
    #[error("Structure error: {0}")]
    Structure(String),

    /// Copying an activation between devices failed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// A module was invoked with an activation living on another device
    #[error("Device mismatch in '{module}': expected {expected}, found {found}")]
    DeviceMismatch {
        module: String,
        expected: String,
        found: String,
    },

    /// Shape or index error inside a tensor operation
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Another generation is in flight and the busy policy rejected this one
    #[error("Engine busy: {0}")]
    Busy(String),

    /// Generation failed, including the single-device fallback
    #[error("Generation failed: {0}")]
    Generation(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<toml::ser::Error> for EngineError {
    fn from(e: toml::ser::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Config("primary_weight must be in (0, 1]".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: primary_weight must be in (0, 1]"
        );
        assert_eq!(EngineError::NotLoaded.to_string(), "Model not loaded");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_relocation_display_names_module() {
        let err = EngineError::Relocation {
            module: "drop".to_string(),
            reason: "no parameters".to_string(),
        };
        assert_eq!(err.to_string(), "Relocation of 'drop' failed: no parameters");
    }
}
