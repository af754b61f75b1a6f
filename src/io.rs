//! I/O utilities for saving and loading adapter checkpoints.
//!
//! This module provides functionality for:
//! - Saving adapter weights to safetensors format
//! - Loading adapter weights from safetensors format
//! - Saving and loading adapter configurations as JSON
//! - Checkpoint directories (`adapter_config.json` + `adapter_model.safetensors`)

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::adapters::lora::LoraConfig;
use crate::backbone::BaseModel;
use crate::error::{EdgeError, Result};
use crate::model::DomainAdapter;

/// Directory name of the final adapter checkpoint under a run's output directory.
pub const ADAPTER_DIR_NAME: &str = "adapter_final";
/// Configuration file inside a checkpoint directory.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";
/// Weights file inside a checkpoint directory.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Trait for adapters that can be saved and loaded.
pub trait SaveLoad {
    /// Get all adapter tensors as a map of name -> tensor.
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be materialized.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    /// Load adapter tensors from a state dict.
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or mis-shaped.
    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()>;
}

/// Save adapter weights to a safetensors file.
///
/// # Errors
/// Returns an error if:
/// - Failed to get state dict from adapter
/// - Failed to serialize tensors or write the file
pub fn save_adapter_weights<P: AsRef<Path>>(adapter: &dyn SaveLoad, path: P) -> Result<()> {
    let state_dict = adapter.state_dict()?;
    candle_core::safetensors::save(&state_dict, path.as_ref())?;
    Ok(())
}

/// Load adapter weights from a safetensors file.
///
/// # Errors
/// Returns an error if:
/// - Failed to read or parse the file
/// - Failed to load tensors into adapter
pub fn load_adapter_weights<P: AsRef<Path>>(
    adapter: &mut dyn SaveLoad,
    path: P,
    device: &Device,
) -> Result<()> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| EdgeError::WeightLoad(format!("{}: {e}", path.display())))?;
    adapter.load_state_dict(tensors)
}

/// Save a configuration to a JSON file.
///
/// # Errors
/// Returns an error if serialization or file writing fails
pub fn save_adapter_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

/// Load a configuration from a JSON file.
///
/// # Errors
/// Returns an error if file reading or deserialization fails
pub fn load_adapter_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Write `adapter` as a checkpoint directory, creating it if needed.
///
/// # Errors
/// Returns an error if the directory or either file cannot be written.
pub fn save_adapter(adapter: &DomainAdapter, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    save_adapter_config(adapter.config(), dir.join(ADAPTER_CONFIG_FILENAME))?;
    save_adapter_weights(adapter, dir.join(ADAPTER_WEIGHTS_FILENAME))?;
    debug!(path = %dir.display(), "saved adapter checkpoint");
    Ok(())
}

/// Read a checkpoint directory written by [`save_adapter`] and bind it to `base`.
///
/// # Errors
/// Returns an error if a file is missing, the configuration is invalid, or a tensor does
/// not fit the backbone's layers.
pub fn load_adapter(dir: &Path, base: &BaseModel) -> Result<DomainAdapter> {
    let config: LoraConfig = load_adapter_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
    let mut adapter = DomainAdapter::new(base, config)?;
    load_adapter_weights(&mut adapter, dir.join(ADAPTER_WEIGHTS_FILENAME), base.device())?;
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::{AdapterVariant, LoraInitialization};
    use crate::device::DeviceContext;
    use crate::traits::LayerDeltas;
    use tempfile::TempDir;

    struct MockAdapter {
        weights: HashMap<String, Tensor>,
    }

    impl SaveLoad for MockAdapter {
        fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
            Ok(self.weights.clone())
        }

        fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
            self.weights = state_dict;
            Ok(())
        }
    }

    #[test]
    fn test_save_load_adapter_weights() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let weights_path = temp_dir.path().join("adapter.safetensors");

        let mut weights = HashMap::new();
        weights.insert(
            "proj.lora_a.weight".to_string(),
            Tensor::randn(0f32, 1f32, (4, 8), &device)?,
        );
        let adapter = MockAdapter { weights };
        save_adapter_weights(&adapter, &weights_path)?;

        let mut loaded = MockAdapter {
            weights: HashMap::new(),
        };
        load_adapter_weights(&mut loaded, &weights_path, &device)?;
        assert_eq!(loaded.weights["proj.lora_a.weight"].dims(), &[4, 8]);
        Ok(())
    }

    #[test]
    fn test_checkpoint_roundtrip_preserves_outputs() -> anyhow::Result<()> {
        let base = BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), None)?;
        let config = LoraConfig {
            r: 2,
            alpha: 4.0,
            variant: AdapterVariant::WeightDecomposed,
            target_modules: vec!["fc".into(), "classifier".into()],
            init_lora_weights: LoraInitialization::Gaussian,
            ..Default::default()
        };
        let adapter = DomainAdapter::new(&base, config.clone())?;

        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join(ADAPTER_DIR_NAME);
        save_adapter(&adapter, &dir)?;
        assert!(dir.join(ADAPTER_CONFIG_FILENAME).is_file());
        assert!(dir.join(ADAPTER_WEIGHTS_FILENAME).is_file());

        let loaded = load_adapter(&dir, &base)?;
        assert_eq!(loaded.config(), &config);

        let input = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;
        let a = base
            .forward(&input, Some(&adapter as &dyn LayerDeltas))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let b = base
            .forward(&input, Some(&loaded as &dyn LayerDeltas))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_load_missing_checkpoint() -> anyhow::Result<()> {
        let base = BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), None)?;
        let temp_dir = TempDir::new()?;
        assert!(load_adapter(temp_dir.path(), &base).is_err());
        Ok(())
    }

    #[test]
    fn test_save_load_config() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.json");
        let config = LoraConfig::default();

        save_adapter_config(&config, &config_path)?;
        let loaded: LoraConfig = load_adapter_config(&config_path)?;
        assert_eq!(config, loaded);
        Ok(())
    }
}
