//! DoRA (Weight-Decomposed Low-Rank Adaptation).
//!
//! DoRA decomposes the adapted weight into magnitude and direction:
//! `W' = m * (W + ΔW) / ||W + ΔW||_row`
//!
//! where `ΔW = scale * (B @ A)` is the standard LoRA update and `m` is a learned
//! per-output magnitude vector, initialized to `||W||_row` so a fresh adapter with
//! `B = 0` reproduces the base layer.
//!
//! Reference: <https://arxiv.org/abs/2402.09353>

use std::collections::HashMap;

use candle_core::{Device, Module, Tensor};
use candle_nn::Linear;

use crate::adapters::lora::{take_tensor, LoraConfig, LoraLayer};
use crate::error::Result;
use crate::traits::{Adapter, Mergeable};

/// Keeps the row norm away from zero.
const NORM_EPS: f64 = 1e-8;

/// DoRA layer: a LoRA branch plus a per-output magnitude vector.
#[derive(Debug, Clone)]
pub struct DoraLayer {
    lora: LoraLayer,
    /// Magnitude vector `[out_features]`
    magnitude: Tensor,
}

impl DoraLayer {
    /// Create a DoRA layer for `base`, initializing the magnitude from its row norms.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or initialization fails.
    pub fn new(base: &Linear, config: LoraConfig, device: &Device) -> Result<Self> {
        let (out_features, in_features) = base.weight().dims2()?;
        let lora = LoraLayer::new(in_features, out_features, config, device)?;
        let magnitude = row_norms(base.weight())?;
        Ok(Self { lora, magnitude })
    }

    /// The magnitude vector.
    #[must_use]
    pub fn magnitude(&self) -> &Tensor {
        &self.magnitude
    }

    /// The underlying LoRA branch.
    #[must_use]
    pub fn lora(&self) -> &LoraLayer {
        &self.lora
    }

    /// Effective weight `m * (W + ΔW) / ||W + ΔW||_row`.
    ///
    /// # Errors
    /// Returns an error if a tensor op fails.
    pub fn adapted_weight(&self, base_weight: &Tensor) -> Result<Tensor> {
        let combined = self.lora.merge(base_weight)?;
        let norms = row_norms(&combined)?.affine(1.0, NORM_EPS)?;
        let scale = (&self.magnitude / norms)?.unsqueeze(1)?;
        Ok(combined.broadcast_mul(&scale)?)
    }

    /// LoRA factors plus `magnitude`.
    #[must_use]
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        let mut state = self.lora.state_dict();
        state.insert("magnitude".to_string(), self.magnitude.clone());
        state
    }

    /// Replace all tensors from a state dict produced by [`Self::state_dict`].
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or its shape differs.
    pub fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        let magnitude = take_tensor(state_dict, "magnitude", &self.magnitude)?;
        self.lora.load_state_dict(state_dict)?;
        self.magnitude = magnitude;
        Ok(())
    }
}

/// L2 norm of each row of a `[out, in]` weight.
fn row_norms(weight: &Tensor) -> Result<Tensor> {
    Ok(weight.sqr()?.sum(1)?.sqrt()?)
}

impl Adapter for DoraLayer {
    type Config = LoraConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        let weight = self.adapted_weight(base.weight())?;
        let adapted = Linear::new(weight, base.bias().cloned());
        Ok(adapted.forward(input)?)
    }

    fn num_parameters(&self) -> usize {
        self.lora.num_parameters() + self.magnitude.elem_count()
    }

    fn config(&self) -> &Self::Config {
        self.lora.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::{AdapterVariant, LoraInitialization};
    use candle_core::DType;

    fn dora_config() -> LoraConfig {
        LoraConfig {
            r: 4,
            alpha: 8.0,
            variant: AdapterVariant::WeightDecomposed,
            ..Default::default()
        }
    }

    fn base() -> Result<Linear> {
        let weight = Tensor::randn(0f32, 1f32, (6, 10), &Device::Cpu)?;
        let bias = Tensor::ones(6, DType::F32, &Device::Cpu)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    #[test]
    fn test_fresh_dora_reproduces_base() -> Result<()> {
        let base = base()?;
        let layer = DoraLayer::new(&base, dora_config(), &Device::Cpu)?;
        let input = Tensor::randn(0f32, 1f32, (2, 10), &Device::Cpu)?;

        let expected = base.forward(&input)?;
        let actual = layer.forward(&input, &base)?;
        let diff = (expected - actual)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_adapted_rows_have_magnitude_norm() -> Result<()> {
        let base = base()?;
        let config = LoraConfig {
            init_lora_weights: LoraInitialization::Gaussian,
            ..dora_config()
        };
        let layer = DoraLayer::new(&base, config, &Device::Cpu)?;
        let adapted = layer.adapted_weight(base.weight())?;

        let norms = row_norms(&adapted)?.to_vec1::<f32>()?;
        let magnitude = layer.magnitude().to_vec1::<f32>()?;
        for (n, m) in norms.iter().zip(&magnitude) {
            assert!((n - m).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_num_parameters_includes_magnitude() -> Result<()> {
        let layer = DoraLayer::new(&base()?, dora_config(), &Device::Cpu)?;
        assert_eq!(layer.num_parameters(), 4 * (10 + 6) + 6);
        Ok(())
    }
}
