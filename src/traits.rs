//! Core traits for domain adapters.

use candle_core::Tensor;
use candle_nn::Linear;

use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Per-layer adapter composed with a read-only base linear layer.
pub trait Adapter: Send + Sync {
    /// The configuration type for this adapter.
    type Config: AdapterConfig;

    /// Forward pass through `base` with this adapter's delta applied.
    ///
    /// # Arguments
    /// * `input` - Input tensor
    /// * `base` - The frozen layer being adapted; never modified
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Get the adapter's configuration.
    fn config(&self) -> &Self::Config;
}

/// Trait for adapters whose delta can be folded into a base weight.
pub trait Mergeable: Adapter {
    /// Merge adapter weights into base model weights.
    ///
    /// # Arguments
    /// * `base_weight` - The original weight tensor to merge into
    ///
    /// # Returns
    /// New tensor with adapter weights merged
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor>;

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor>;
}

/// Capability to apply deltas for named target layers on top of a shared base.
///
/// The backbone calls this for every adaptable layer during a forward pass; implementors
/// decide whether they target the layer and fall back to the plain base layer otherwise.
pub trait LayerDeltas {
    /// Forward `input` through the base layer `layer`, with this provider's delta if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward_layer(&self, layer: &str, input: &Tensor, base: &Linear) -> Result<Tensor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Trait object safety check
    fn _assert_adapter_object_safe(_: &dyn Adapter<Config = crate::LoraConfig>) {}
    fn _assert_deltas_object_safe(_: &dyn LayerDeltas) {}
}
