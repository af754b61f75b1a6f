//! Domain adapters: named sets of per-layer deltas over a shared backbone.
//!
//! This module provides functionality for:
//! - Pattern matching for layer names (e.g., `*.fc`, `blocks.*`, `classifier`)
//! - Building one adapter layer per matching backbone layer
//! - Routing backbone forward passes through those layers

use std::collections::HashMap;

use candle_core::{Module, Tensor};
use candle_nn::Linear;
use tracing::debug;

use crate::adapters::lora::{AdapterVariant, LoraConfig};
use crate::adapters::ExpertLayer;
use crate::backbone::BaseModel;
use crate::error::{EdgeError, Result};
use crate::io::SaveLoad;
use crate::traits::{AdapterConfig, LayerDeltas};

/// Pattern for matching module names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePattern {
    /// Match a module by name or by its last dotted components
    Exact(String),
    /// Match modules ending with suffix (e.g., `*.fc`)
    Suffix(String),
    /// Match modules starting with prefix (e.g., `blocks.*`)
    Prefix(String),
    /// Match all modules
    All,
}

impl ModulePattern {
    /// Parse a pattern string into a `ModulePattern`.
    ///
    /// # Examples
    /// - `"blocks.0.fc"` -> `Exact`
    /// - `"*.fc"` -> `Suffix`
    /// - `"blocks.*"` -> `Prefix`
    /// - `"*"` -> `All`
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        match pattern {
            "*" => Self::All,
            s if s.starts_with("*.") => Self::Suffix(s[2..].to_string()),
            s if s.ends_with(".*") => Self::Prefix(s[..s.len() - 2].to_string()),
            s => Self::Exact(s.to_string()),
        }
    }

    /// Check if a module name matches this pattern.
    ///
    /// `Exact("fc")` matches both `fc` and `blocks.0.fc`, so plain layer kinds work as
    /// target names.
    #[must_use]
    pub fn matches(&self, module_name: &str) -> bool {
        match self {
            Self::Exact(name) => {
                module_name == name
                    || module_name
                        .strip_suffix(name.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
            Self::Suffix(suffix) => module_name.ends_with(suffix.as_str()),
            Self::Prefix(prefix) => module_name.starts_with(prefix.as_str()),
            Self::All => true,
        }
    }
}

/// Resolve target patterns against layer names, keeping `layer_names` order.
#[must_use]
pub fn resolve_targets<'a>(patterns: &[String], layer_names: &[&'a str]) -> Vec<&'a str> {
    let patterns: Vec<ModulePattern> = patterns.iter().map(|p| ModulePattern::parse(p)).collect();
    layer_names
        .iter()
        .copied()
        .filter(|name| patterns.iter().any(|p| p.matches(name)))
        .collect()
}

/// A domain expert: one adapter layer per targeted backbone layer.
///
/// Holds no reference to the backbone; the base layer is supplied at forward time.
#[derive(Debug, Clone)]
pub struct DomainAdapter {
    config: LoraConfig,
    /// Adapted layers in backbone forward order
    layers: Vec<(String, ExpertLayer)>,
}

impl DomainAdapter {
    /// Build a freshly initialized adapter for every backbone layer matching
    /// `config.target_modules`.
    ///
    /// # Errors
    /// Returns [`EdgeError::NoMatchingLayers`] if nothing matches, or an error if the
    /// configuration is invalid.
    pub fn new(base: &BaseModel, config: LoraConfig) -> Result<Self> {
        config.validate()?;
        let names = base.layer_names();
        let targets = resolve_targets(&config.target_modules, &names);
        if targets.is_empty() {
            return Err(EdgeError::NoMatchingLayers {
                patterns: config.target_modules.clone(),
            });
        }

        let mut layers = Vec::with_capacity(targets.len());
        for name in targets {
            let linear = base.layer(name).ok_or_else(|| EdgeError::DimensionMismatch {
                message: format!("backbone has no layer '{name}'"),
            })?;
            layers.push((name.to_string(), ExpertLayer::new(linear, &config)?));
        }
        debug!(variant = %config.variant, layers = layers.len(), "initialized domain adapter");

        Ok(Self { config, layers })
    }

    /// Hyperparameters this adapter was built with.
    #[must_use]
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Low-rank representation.
    #[must_use]
    pub fn variant(&self) -> AdapterVariant {
        self.config.variant
    }

    /// Targeted layer names in forward order.
    #[must_use]
    pub fn target_layers(&self) -> Vec<&str> {
        self.layers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Adapter layer for a backbone layer, if targeted.
    #[must_use]
    pub fn layer(&self, name: &str) -> Option<&ExpertLayer> {
        self.layers
            .iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, expert)| expert)
    }

    /// Total number of trainable parameters across all targeted layers.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|(_, layer)| layer.num_parameters())
            .sum()
    }
}

impl LayerDeltas for DomainAdapter {
    fn forward_layer(&self, layer: &str, input: &Tensor, base: &Linear) -> Result<Tensor> {
        match self.layer(layer) {
            Some(expert) => expert.forward(input, base),
            None => Ok(base.forward(input)?),
        }
    }
}

impl SaveLoad for DomainAdapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, layer) in &self.layers {
            for (key, tensor) in layer.state_dict() {
                state.insert(format!("{name}.{key}"), tensor);
            }
        }
        Ok(state)
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        for (name, layer) in &mut self.layers {
            let prefix = format!("{name}.");
            let scoped: HashMap<String, Tensor> = state_dict
                .iter()
                .filter_map(|(key, tensor)| {
                    key.strip_prefix(&prefix)
                        .map(|rest| (rest.to_string(), tensor.clone()))
                })
                .collect();
            layer.load_state_dict(&scoped)?;
        }
        Ok(())
    }
}

/// Format parameter count with appropriate units.
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::LoraInitialization;
    use crate::device::DeviceContext;
    use candle_core::Device;

    fn tiny() -> Result<BaseModel> {
        BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), None)
    }

    fn config(targets: &[&str]) -> LoraConfig {
        LoraConfig {
            r: 4,
            alpha: 8.0,
            target_modules: targets.iter().map(|t| (*t).to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_module_pattern_exact() {
        let pattern = ModulePattern::parse("blocks.0.fc");
        assert!(pattern.matches("blocks.0.fc"));
        assert!(!pattern.matches("blocks.1.fc"));
    }

    #[test]
    fn test_module_pattern_exact_matches_last_component() {
        let pattern = ModulePattern::parse("fc");
        assert!(pattern.matches("fc"));
        assert!(pattern.matches("blocks.3.fc"));
        assert!(!pattern.matches("blocks.3.xfc"));
    }

    #[test]
    fn test_module_pattern_suffix() {
        let pattern = ModulePattern::parse("*.fc");
        assert!(pattern.matches("blocks.0.fc"));
        assert!(!pattern.matches("fc.out"));
    }

    #[test]
    fn test_module_pattern_prefix() {
        let pattern = ModulePattern::parse("blocks.*");
        assert!(pattern.matches("blocks.0.fc"));
        assert!(!pattern.matches("proj"));
    }

    #[test]
    fn test_module_pattern_all() {
        let pattern = ModulePattern::parse("*");
        assert!(pattern.matches("anything"));
        assert!(pattern.matches(""));
    }

    #[test]
    fn test_resolve_targets_keeps_forward_order() {
        let names = ["proj", "blocks.0.fc", "blocks.1.fc", "classifier"];
        let targets = resolve_targets(&["classifier".into(), "fc".into()], &names);
        assert_eq!(targets, vec!["blocks.0.fc", "blocks.1.fc", "classifier"]);
    }

    #[test]
    fn test_domain_adapter_targets() -> Result<()> {
        let base = tiny()?;
        let adapter = DomainAdapter::new(&base, config(&["fc"]))?;
        assert_eq!(adapter.target_layers(), vec!["blocks.0.fc", "blocks.1.fc"]);
        // 2 layers of 32x32, r = 4: 2 * 4 * (32 + 32)
        assert_eq!(adapter.num_parameters(), 512);
        Ok(())
    }

    #[test]
    fn test_domain_adapter_no_match() -> Result<()> {
        let base = tiny()?;
        let result = DomainAdapter::new(&base, config(&["attention"]));
        assert!(matches!(result, Err(EdgeError::NoMatchingLayers { .. })));
        Ok(())
    }

    #[test]
    fn test_domain_adapter_changes_output() -> Result<()> {
        let base = tiny()?;
        let adapter = DomainAdapter::new(
            &base,
            LoraConfig {
                init_lora_weights: LoraInitialization::Gaussian,
                ..config(&["*"])
            },
        )?;
        let input = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;
        let plain = base.forward(&input, None)?;
        let adapted = base.forward(&input, Some(&adapter as &dyn LayerDeltas))?;
        let diff = (plain - adapted)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }

    #[test]
    fn test_state_dict_keys() -> Result<()> {
        let base = tiny()?;
        let dora = DomainAdapter::new(
            &base,
            LoraConfig {
                variant: AdapterVariant::WeightDecomposed,
                ..config(&["classifier"])
            },
        )?;
        let mut keys: Vec<String> = dora.state_dict()?.into_keys().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "classifier.lora_a.weight",
                "classifier.lora_b.weight",
                "classifier.magnitude"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_load_state_dict_copies_weights() -> Result<()> {
        let base = tiny()?;
        let source = DomainAdapter::new(&base, config(&["fc"]))?;
        let mut target = DomainAdapter::new(&base, config(&["fc"]))?;
        target.load_state_dict(source.state_dict()?)?;

        let key = "blocks.1.fc.lora_a.weight";
        let a = source.state_dict()?[key].flatten_all()?.to_vec1::<f32>()?;
        let b = target.state_dict()?[key].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_format_parameter_count() {
        assert_eq!(format_parameter_count(100), "100");
        assert_eq!(format_parameter_count(1_234), "1.23K");
        assert_eq!(format_parameter_count(12_345_678), "12.35M");
        assert_eq!(format_parameter_count(1_234_567_890), "1.23B");
    }
}
