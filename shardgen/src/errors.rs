use thiserror::Error;

/// Errors that can occur while planning, loading or sampling.
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error occurred (checkpoint files, config files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor shape error (mismatched operands, bad slice, etc.)
    #[error("Shape error: {0}")]
    Shape(String),

    /// Sharding error (unknown mesh axis, inconsistent plan, etc.)
    #[error("Sharding error: {0}")]
    Sharding(String),

    /// Checkpoint error (malformed file, missing tensor, etc.)
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Stored tensor does not match its recorded hash
    #[error("Integrity error: tensor '{name}' expected sha256 {expected}, got {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },

    /// Caller passed an argument the operation cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Named resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Config("cache_length must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: cache_length must be positive"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let engine_err: EngineError = io_err.into();
        assert!(engine_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_integrity_error_names_tensor() {
        let err = EngineError::Integrity {
            name: "layer_0/attn/q_proj".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("layer_0/attn/q_proj"));
        assert!(msg.contains("aa"));
        assert!(msg.contains("bb"));
    }

    #[test]
    fn test_toml_error_conversion() {
        let err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::Serialization(_)));
    }
}
