//! Save and load an adapter checkpoint.
//!
//! This example demonstrates:
//! - Writing an adapter as `adapter_config.json` + `adapter_model.safetensors`
//! - Loading it back into a registry under a new name
//! - Verifying both produce identical predictions

use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use edge_lora::{
    AdaptiveClassifier, BaseModel, DeviceContext, LoraConfig, LoraInitialization, SaveLoad,
    ADAPTER_DIR_NAME,
};
use tempfile::TempDir;

fn main() -> Result<()> {
    println!("=== Save and Load Adapter Checkpoint Example ===\n");

    let base = BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), None)?;
    let mut classifier = AdaptiveClassifier::new(Arc::new(base));

    let config = LoraConfig {
        r: 8,
        alpha: 16.0,
        init_lora_weights: LoraInitialization::Gaussian,
        ..Default::default()
    };
    classifier.add_adapter("fog", &config, false)?;

    let temp_dir = TempDir::new()?;
    let checkpoint = temp_dir.path().join(ADAPTER_DIR_NAME);
    classifier.save_adapter("fog", &checkpoint)?;
    println!("Saved checkpoint to {}", checkpoint.display());

    let state_dict = classifier.registry().get_adapter("fog")?.state_dict()?;
    let mut keys: Vec<_> = state_dict.keys().collect();
    keys.sort();
    for key in keys {
        println!("  - {key}: {:?}", state_dict[key].dims());
    }

    classifier.load_adapter(&checkpoint, "fog_reloaded", false)?;
    let frame = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;

    classifier.switch_adapter("fog")?;
    let original = classifier.predict_tensor(&frame)?;
    classifier.switch_adapter("fog_reloaded")?;
    let reloaded = classifier.predict_tensor(&frame)?;

    let max_diff = original
        .probabilities
        .iter()
        .zip(&reloaded.probabilities)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    println!("\nMaximum probability difference: {max_diff:.10}");
    if max_diff > 1e-6 {
        anyhow::bail!("reloaded adapter differs by {max_diff}");
    }
    println!("Checkpoint round trip verified");
    Ok(())
}
