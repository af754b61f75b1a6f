//! Low-rank adapter implementations.

pub mod dora;
pub mod lora;

use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::Linear;

use crate::error::Result;
use crate::traits::Adapter;
use dora::DoraLayer;
use lora::{AdapterVariant, LoraConfig, LoraLayer};

/// One adapted layer of a domain adapter, in either variant.
#[derive(Debug, Clone)]
pub enum ExpertLayer {
    /// Standard LoRA
    Lora(LoraLayer),
    /// Weight-decomposed LoRA
    Dora(DoraLayer),
}

impl ExpertLayer {
    /// Initialize an adapter layer for `base` according to `config.variant`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or initialization fails.
    pub fn new(base: &Linear, config: &LoraConfig) -> Result<Self> {
        let device = base.weight().device();
        match config.variant {
            AdapterVariant::Standard => {
                let (out_features, in_features) = base.weight().dims2()?;
                Ok(Self::Lora(LoraLayer::new(
                    in_features,
                    out_features,
                    config.clone(),
                    device,
                )?))
            }
            AdapterVariant::WeightDecomposed => {
                Ok(Self::Dora(DoraLayer::new(base, config.clone(), device)?))
            }
        }
    }

    /// Forward through `base` with this layer's delta applied.
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        match self {
            Self::Lora(layer) => layer.forward(input, base),
            Self::Dora(layer) => layer.forward(input, base),
        }
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        match self {
            Self::Lora(layer) => layer.num_parameters(),
            Self::Dora(layer) => layer.num_parameters(),
        }
    }

    /// Tensors keyed relative to the layer.
    #[must_use]
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        match self {
            Self::Lora(layer) => layer.state_dict(),
            Self::Dora(layer) => layer.state_dict(),
        }
    }

    /// Replace tensors from a state dict keyed like [`Self::state_dict`].
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or mis-shaped.
    pub fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        match self {
            Self::Lora(layer) => layer.load_state_dict(state_dict),
            Self::Dora(layer) => layer.load_state_dict(state_dict),
        }
    }
}
