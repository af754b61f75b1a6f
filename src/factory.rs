//! Builds the backbone and adapter hyperparameters from an [`EdgeConfig`].

use tracing::info;

use crate::adapters::lora::LoraConfig;
use crate::backbone::BaseModel;
use crate::config::EdgeConfig;
use crate::device::DeviceContext;
use crate::error::{EdgeError, Result};
use crate::model::resolve_targets;

/// Validate `config`, load its backbone and resolve the adapter hyperparameters.
///
/// All checks, including that the target patterns match at least one backbone layer, run
/// before any adapter is constructed.
///
/// # Errors
/// Returns an error if the configuration is invalid, the backbone cannot be loaded, or no
/// backbone layer matches `adapter.target_modules`.
pub fn build(config: &EdgeConfig, ctx: &DeviceContext) -> Result<(BaseModel, LoraConfig)> {
    config.validate()?;
    let lora = config.lora_config()?;

    let base = BaseModel::load(&config.model.base_model, ctx, Some(config.model.num_classes))?;
    let names = base.layer_names();
    let targets = resolve_targets(&lora.target_modules, &names);
    if targets.is_empty() {
        return Err(EdgeError::NoMatchingLayers {
            patterns: lora.target_modules.clone(),
        });
    }

    info!(
        base_model = %config.model.base_model,
        method = %lora.variant,
        rank = lora.r,
        targets = ?targets,
        "built model from configuration"
    );
    Ok((base, lora))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::AdapterVariant;
    use crate::model::DomainAdapter;

    fn config(method: &str, targets: &str) -> Result<EdgeConfig> {
        EdgeConfig::from_yaml_str(&format!(
            "model: {{base_model: edgenet-tiny, num_classes: 3}}\n\
             adapter: {{method: {method}, r: 4, lora_alpha: 8, target_modules: [{targets}]}}\n"
        ))
    }

    #[test]
    fn test_build_remaps_classes() -> Result<()> {
        let (base, lora) = build(&config("LoRA", "fc")?, &DeviceContext::cpu())?;
        assert_eq!(base.num_classes(), 3);
        assert_eq!(lora.variant, AdapterVariant::Standard);
        let adapter = DomainAdapter::new(&base, lora)?;
        assert_eq!(adapter.target_layers().len(), 2);
        Ok(())
    }

    #[test]
    fn test_build_dora() -> Result<()> {
        let (_, lora) = build(&config("dora", "classifier")?, &DeviceContext::cpu())?;
        assert_eq!(lora.variant, AdapterVariant::WeightDecomposed);
        Ok(())
    }

    #[test]
    fn test_build_rejects_unmatched_targets() -> Result<()> {
        let result = build(&config("lora", "attention")?, &DeviceContext::cpu());
        assert!(matches!(result, Err(EdgeError::NoMatchingLayers { .. })));
        Ok(())
    }

    #[test]
    fn test_build_rejects_unknown_backbone() -> Result<()> {
        let mut cfg = config("lora", "fc")?;
        cfg.model.base_model = "resnet-404".into();
        let result = build(&cfg, &DeviceContext::cpu());
        assert!(matches!(result, Err(EdgeError::UnknownBackbone { .. })));
        Ok(())
    }
}
