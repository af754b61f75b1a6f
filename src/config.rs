//! Experiment configuration.
//!
//! Loaded with the `config` crate: one file (YAML, TOML or JSON by extension) followed by
//! environment overrides such as `EDGE_LORA_ADAPTER__R=8` or
//! `EDGE_LORA_ADAPTER__TARGET_MODULES=fc,classifier`.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::adapters::lora::{AdapterVariant, LoraConfig, LoraInitialization};
use crate::error::{EdgeError, Result};
use crate::monitor::LogFormat;
use crate::traits::AdapterConfig;
use crate::uncertainty::DEFAULT_ENTROPY_THRESHOLD;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "EDGE_LORA";
/// Separator between nested keys in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Top-level experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    /// Run metadata and output location
    #[serde(default)]
    pub project: ProjectConfig,
    /// Backbone selection
    pub model: ModelConfig,
    /// Adapter hyperparameters
    pub adapter: AdapterSection,
    /// Training settings
    #[serde(default)]
    pub training: TrainingConfig,
    /// Session logging
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// `project` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Experiment name
    #[serde(default)]
    pub name: Option<String>,
    /// Root directory for checkpoints
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: None,
            output_dir: default_output_dir(),
        }
    }
}

/// `model` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Built-in backbone id or model directory
    pub base_model: String,
    /// Number of output classes
    pub num_classes: usize,
}

/// `adapter` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterSection {
    /// `lora` or `dora`, case-insensitive
    pub method: String,
    /// Rank
    pub r: usize,
    /// Scaling numerator
    pub lora_alpha: f64,
    /// Dropout probability
    #[serde(default = "default_dropout")]
    pub lora_dropout: f64,
    /// Target layer patterns
    pub target_modules: Vec<String>,
}

fn default_dropout() -> f64 {
    0.1
}

/// `training` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    /// `auto`, `cuda`, `mps`/`metal` or `cpu`
    #[serde(default = "default_device")]
    pub device: String,
    /// Mini-batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Optimizer step size
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Passes over the training set
    #[serde(default = "default_epochs")]
    pub epochs: usize,
}

fn default_device() -> String {
    "auto".into()
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_epochs() -> usize {
    5
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            epochs: default_epochs(),
        }
    }
}

/// `monitor` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Directory for session logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Log layout
    #[serde(default)]
    pub format: LogFormat,
    /// Entropy at or above which a frame counts as confused
    #[serde(default = "default_threshold")]
    pub entropy_threshold: f32,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("results/logs")
}

fn default_threshold() -> f32 {
    DEFAULT_ENTROPY_THRESHOLD
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            format: LogFormat::default(),
            entropy_threshold: default_threshold(),
        }
    }
}

impl EdgeConfig {
    /// Load from a file, applying `EDGE_LORA_*` environment overrides, and validate.
    ///
    /// # Errors
    /// Returns an error if the file is missing or malformed, has unknown fields, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("adapter.target_modules")
    }

    fn load_with_env(path: &Path, env: Environment) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from(path))
            .add_source(env)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text without environment overrides, and validate.
    ///
    /// # Errors
    /// Returns an error if the text is malformed or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and value ranges.
    ///
    /// # Errors
    /// Returns [`EdgeError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.model.base_model.trim().is_empty() {
            return Err(EdgeError::InvalidConfig("model.base_model is empty".into()));
        }
        if self.model.num_classes == 0 {
            return Err(EdgeError::InvalidConfig(
                "model.num_classes must be > 0".into(),
            ));
        }
        if self.training.batch_size == 0 {
            return Err(EdgeError::InvalidConfig(
                "training.batch_size must be > 0".into(),
            ));
        }
        self.lora_config()?.validate()
    }

    /// Adapter variant named by `adapter.method`.
    ///
    /// # Errors
    /// Returns [`EdgeError::InvalidConfig`] for anything other than `lora` or `dora`.
    pub fn variant(&self) -> Result<AdapterVariant> {
        self.adapter.method.parse()
    }

    /// Adapter hyperparameters.
    ///
    /// # Errors
    /// Returns an error if the method is unknown.
    pub fn lora_config(&self) -> Result<LoraConfig> {
        Ok(LoraConfig {
            r: self.adapter.r,
            alpha: self.adapter.lora_alpha,
            dropout: self.adapter.lora_dropout,
            target_modules: self.adapter.target_modules.clone(),
            variant: self.variant()?,
            init_lora_weights: LoraInitialization::Standard,
        })
    }

    /// Experiment name, falling back to the backbone id.
    #[must_use]
    pub fn experiment_name(&self) -> &str {
        self.project
            .name
            .as_deref()
            .unwrap_or(self.model.base_model.as_str())
    }

    /// Checkpoint directory for the final adapter.
    #[must_use]
    pub fn adapter_dir(&self) -> PathBuf {
        self.project.output_dir.join(crate::io::ADAPTER_DIR_NAME)
    }
}
