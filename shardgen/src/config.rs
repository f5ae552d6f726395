use crate::checkpoint::default_checkpoint_dir;
use crate::device::{Device, DeviceCapabilities, DeviceMesh, MeshAxis};
use crate::errors::{EngineError, Result};
use crate::sampler::SamplingMethod;
use crate::sharding::ShardingStrategy;
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the shardgen CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub mesh: MeshConfig,
    pub sharding: ShardingStrategy,
    pub sampler: SamplerConfig,
    pub checkpoints: CheckpointConfig,
    pub logging: LoggingConfig,
}

/// Virtual device mesh layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    pub axes: Vec<MeshAxis>,
}

/// Sampler defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub cache_length: usize,
    pub seed: u64,
    pub max_new_tokens: usize,
    pub sampling: SamplingMethod,
}

/// Checkpoint storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding `.ckpt` files, `~` expands to the home directory
    pub dir: String,
    pub dtype: DType,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mesh: MeshConfig {
                axes: vec![MeshAxis::new("data", 2)],
            },
            sharding: ShardingStrategy::default(),
            sampler: SamplerConfig {
                cache_length: 256,
                seed: 0,
                max_new_tokens: 32,
                sampling: SamplingMethod::Greedy,
            },
            checkpoints: CheckpointConfig {
                dir: "~/.shardgen/checkpoints".to_string(),
                dtype: DType::F32,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: "~/.shardgen/logs".to_string(),
            },
        }
    }
}

impl Config {
    /// Get default configuration file path: `~/.shardgen/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".shardgen").join("config.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: Config = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let n: usize = self.mesh.axes.iter().map(|a| a.size).product();
        let devices = (0..n).map(|i| Device::virtual_device(i as u32, 0)).collect();
        let mesh = DeviceMesh::new(devices, self.mesh.axes.clone())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        if let Some(axis) = self.sharding.axis() {
            mesh.axis_index(axis).map_err(|_| {
                EngineError::Config(format!(
                    "Sharding axis '{}' is not a mesh axis",
                    axis
                ))
            })?;
        }

        if self.sampler.cache_length == 0 {
            return Err(EngineError::Config("cache_length must be at least 1".into()));
        }
        self.sampler
            .sampling
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        if self.checkpoints.dir.trim().is_empty() {
            return Err(EngineError::Config("checkpoints.dir must not be empty".into()));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(EngineError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Virtual mesh on this host with the configured axes
    pub fn build_mesh(&self, caps: &DeviceCapabilities) -> Result<DeviceMesh> {
        DeviceMesh::virtual_host(self.mesh.axes.clone(), caps)
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        expand_home(&self.checkpoints.dir).unwrap_or_else(default_checkpoint_dir)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        expand_home(&self.logging.log_dir)
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None if path == "~" => dirs::home_dir(),
        None => Some(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.mesh.axes = vec![MeshAxis::new("data", 2), MeshAxis::new("model", 2)];
        config.sharding = ShardingStrategy::tensor_parallel("model");
        config.sampler.sampling = SamplingMethod::TopK { k: 20, temperature: 0.7 };
        config.save(&path).unwrap();

        assert!(!path.with_extension("toml.tmp").exists());
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_sharding_axis_must_exist() {
        let mut config = Config::default();
        config.sharding = ShardingStrategy::fsdp("model");
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sampler.cache_length = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mesh.axes = vec![MeshAxis::new("data", 0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/tmp/ckpt"), Some(PathBuf::from("/tmp/ckpt")));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/x"), Some(home.join("x")));
        }
    }
}
