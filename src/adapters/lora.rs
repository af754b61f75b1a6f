//! LoRA (Low-Rank Adaptation) implementation.
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices: `ΔW = BA` where `B ∈ R^{d×r}` and `A ∈ R^{r×k}`.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::error::{EdgeError, Result};
use crate::traits::{Adapter, AdapterConfig, Mergeable};

/// Which low-rank representation an adapter uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterVariant {
    /// Plain low-rank decomposition (`lora`).
    #[default]
    #[serde(rename = "lora")]
    Standard,
    /// Magnitude/direction decomposition on top of LoRA (`dora`).
    #[serde(rename = "dora")]
    WeightDecomposed,
}

impl FromStr for AdapterVariant {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lora" => Ok(Self::Standard),
            "dora" => Ok(Self::WeightDecomposed),
            other => Err(EdgeError::InvalidConfig(format!(
                "unknown adapter method '{other}' (expected lora or dora)"
            ))),
        }
    }
}

impl fmt::Display for AdapterVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("lora"),
            Self::WeightDecomposed => f.write_str("dora"),
        }
    }
}

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator; the effective scale is `alpha / r`.
    pub alpha: f64,

    /// Dropout probability applied to LoRA inputs during training.
    #[serde(default)]
    pub dropout: f64,

    /// Target modules to apply LoRA to.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Low-rank representation.
    #[serde(default)]
    pub variant: AdapterVariant,

    /// Initialize A with Gaussian, B with zeros (standard) or both Gaussian.
    #[serde(default)]
    pub init_lora_weights: LoraInitialization,
}

fn default_target_modules() -> Vec<String> {
    vec!["fc".into()]
}

/// Initialization strategy for LoRA weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoraInitialization {
    /// Standard: A ~ N(0, σ²), B = 0
    #[default]
    Standard,
    /// Gaussian for both: A, B ~ N(0, σ²)
    Gaussian,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 32.0,
            dropout: 0.1,
            target_modules: default_target_modules(),
            variant: AdapterVariant::Standard,
            init_lora_weights: LoraInitialization::Standard,
        }
    }
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(EdgeError::InvalidConfig("rank must be > 0".into()));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(EdgeError::InvalidConfig("alpha must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(EdgeError::InvalidConfig(
                "dropout must be between 0 and 1".into(),
            ));
        }
        if self.target_modules.is_empty() {
            return Err(EdgeError::InvalidConfig(
                "target_modules cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// LoRA layer implementing low-rank adaptation.
///
/// Computes: `output = base(x) + (x @ A^T @ B^T) * scaling`
#[derive(Debug, Clone)]
pub struct LoraLayer {
    /// Down projection: in_features → r
    lora_a: Linear,
    /// Up projection: r → out_features
    lora_b: Linear,
    /// Scaling factor = alpha / r
    scaling: f64,
    /// Configuration
    config: LoraConfig,
    /// Input dimension
    in_features: usize,
    /// Output dimension
    out_features: usize,
}

impl LoraLayer {
    /// Create a new LoRA layer.
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `config` - LoRA configuration
    /// * `device` - Device to create tensors on
    ///
    /// # Errors
    /// Returns error if configuration is invalid or weight initialization fails.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: LoraConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        // Kaiming-style scale for A
        let std = (1.0 / in_features as f64).sqrt() as f32;
        let a_weight = Tensor::randn(0.0f32, std, (config.r, in_features), device)?;
        let b_weight = match config.init_lora_weights {
            LoraInitialization::Standard => {
                Tensor::zeros((out_features, config.r), DType::F32, device)?
            }
            LoraInitialization::Gaussian => {
                let std = (1.0 / config.r as f64).sqrt() as f32;
                Tensor::randn(0.0f32, std, (out_features, config.r), device)?
            }
        };

        Self::from_weights(a_weight, b_weight, config)
    }

    /// Create a LoRA layer from existing factor weights.
    ///
    /// `a_weight` is `[r, in_features]`, `b_weight` is `[out_features, r]`.
    ///
    /// # Errors
    /// Returns an error if the shapes disagree with each other or with `config.r`.
    pub fn from_weights(a_weight: Tensor, b_weight: Tensor, config: LoraConfig) -> Result<Self> {
        config.validate()?;
        let (rank, in_features) = a_weight.dims2()?;
        let (out_features, rank_b) = b_weight.dims2()?;
        if rank != config.r || rank_b != config.r {
            return Err(EdgeError::DimensionMismatch {
                message: format!(
                    "LoRA factors have rank {rank}/{rank_b}, config expects {}",
                    config.r
                ),
            });
        }

        let scaling = config.alpha / config.r as f64;

        Ok(Self {
            lora_a: Linear::new(a_weight, None),
            lora_b: Linear::new(b_weight, None),
            scaling,
            config,
            in_features,
            out_features,
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// Input and output dimensions.
    #[must_use]
    pub fn dims(&self) -> (usize, usize) {
        (self.in_features, self.out_features)
    }

    /// Scaled weight update `ΔW = B @ A * scaling`, shaped like the base weight.
    ///
    /// # Errors
    /// Returns an error if the matmul fails.
    pub fn delta_weight(&self) -> Result<Tensor> {
        let delta_w = self.lora_b.weight().matmul(self.lora_a.weight())?;
        Ok(delta_w.affine(self.scaling, 0.0)?)
    }

    /// Low-rank branch only: `x @ A^T @ B^T * scaling`.
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn delta_forward(&self, input: &Tensor) -> Result<Tensor> {
        let lora_out = self.lora_a.forward(input)?;
        let lora_out = self.lora_b.forward(&lora_out)?;
        Ok(lora_out.affine(self.scaling, 0.0)?)
    }

    /// Factor tensors keyed `lora_a.weight` / `lora_b.weight`.
    #[must_use]
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        HashMap::from([
            ("lora_a.weight".to_string(), self.lora_a.weight().clone()),
            ("lora_b.weight".to_string(), self.lora_b.weight().clone()),
        ])
    }

    /// Replace the factors from a state dict produced by [`Self::state_dict`].
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or its shape differs.
    pub fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        let a = take_tensor(state_dict, "lora_a.weight", self.lora_a.weight())?;
        let b = take_tensor(state_dict, "lora_b.weight", self.lora_b.weight())?;
        self.lora_a = Linear::new(a, None);
        self.lora_b = Linear::new(b, None);
        Ok(())
    }
}

/// Fetch `key` and check it has the same shape as `current`.
pub(crate) fn take_tensor(
    state_dict: &HashMap<String, Tensor>,
    key: &str,
    current: &Tensor,
) -> Result<Tensor> {
    let tensor = state_dict
        .get(key)
        .ok_or_else(|| EdgeError::WeightLoad(format!("missing tensor '{key}'")))?;
    if tensor.dims() != current.dims() {
        return Err(EdgeError::ShapeMismatch {
            expected: current.dims().to_vec(),
            actual: tensor.dims().to_vec(),
        });
    }
    Ok(tensor.to_dtype(DType::F32)?.to_device(current.device())?)
}

impl Adapter for LoraLayer {
    type Config = LoraConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        let base_out = base.forward(input)?;
        let lora_out = self.delta_forward(input)?;
        Ok(base_out.broadcast_add(&lora_out)?)
    }

    fn num_parameters(&self) -> usize {
        self.config.r * (self.in_features + self.out_features)
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for LoraLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        Ok(base_weight.broadcast_add(&self.delta_weight()?)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        Ok(merged_weight.broadcast_sub(&self.delta_weight()?)?)
    }
}
