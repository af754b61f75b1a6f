//! Frozen classification backbone.
//!
//! The backbone is a convolutional stem followed by global average pooling and a stack of
//! named linear layers:
//!
//! ```text
//! pixels -> stem.conv -> relu -> mean(h, w) -> proj -> relu
//!        -> [blocks.i.fc -> relu, residual] * num_blocks -> classifier -> logits
//! ```
//!
//! The linear layers are the adapter targets. Their weights are detached constants: nothing
//! in this crate writes to them after [`BaseModel::load`] returns, and forward passes take
//! `&self` and receive adapter deltas through [`LayerDeltas`].

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::device::DeviceContext;
use crate::error::{EdgeError, Result};
use crate::preprocess::Preprocessor;
use crate::traits::LayerDeltas;

/// Backbone architecture description, stored as `config.json` next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Output channels of the stem convolution.
    pub stem_channels: usize,
    /// Width of the linear trunk.
    pub hidden_size: usize,
    /// Number of residual linear blocks.
    pub num_blocks: usize,
    /// Native number of output classes.
    pub num_classes: usize,
    /// Input transform.
    pub preprocess: Preprocessor,
}

/// Identifiers that resolve to a built-in backbone.
///
/// Built-in weights are pseudo-random but seeded by the identifier, so every load of the same
/// id yields the same backbone.
pub const BUILTIN_BACKBONES: &[&str] = &["edgenet-tiny", "edgenet-small"];

/// Weights file inside a backbone directory.
pub const BACKBONE_WEIGHTS_FILENAME: &str = "model.safetensors";
/// Architecture file inside a backbone directory.
pub const BACKBONE_CONFIG_FILENAME: &str = "config.json";

impl BackboneConfig {
    /// Look up a built-in architecture.
    #[must_use]
    pub fn builtin(model_id: &str) -> Option<Self> {
        match model_id {
            "edgenet-tiny" => Some(Self {
                stem_channels: 8,
                hidden_size: 32,
                num_blocks: 2,
                num_classes: 10,
                preprocess: Preprocessor::new(32, 36),
            }),
            "edgenet-small" => Some(Self {
                stem_channels: 32,
                hidden_size: 256,
                num_blocks: 4,
                num_classes: 1000,
                preprocess: Preprocessor::new(224, 256),
            }),
            _ => None,
        }
    }

    /// Check that the architecture can be built and fed.
    ///
    /// # Errors
    /// Returns [`EdgeError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.stem_channels == 0 {
            return Err(EdgeError::InvalidConfig("stem_channels must be > 0".into()));
        }
        if self.hidden_size == 0 {
            return Err(EdgeError::InvalidConfig("hidden_size must be > 0".into()));
        }
        if self.num_classes == 0 {
            return Err(EdgeError::InvalidConfig("num_classes must be > 0".into()));
        }
        self.preprocess.validate()
    }
}

/// Frozen backbone plus its preprocessing transform.
pub struct BaseModel {
    model_id: String,
    config: BackboneConfig,
    stem: Conv2d,
    /// Linear layers in forward order: `proj`, `blocks.{i}.fc`, `classifier`.
    layers: Vec<(String, Linear)>,
    weights: HashMap<String, Tensor>,
    device: Device,
}

impl std::fmt::Debug for BaseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseModel")
            .field("model_id", &self.model_id)
            .field("config", &self.config)
            .field("layers", &self.layer_names())
            .finish_non_exhaustive()
    }
}

impl BaseModel {
    /// Load a backbone.
    ///
    /// `model_id` is either one of [`BUILTIN_BACKBONES`] or a directory containing
    /// [`BACKBONE_CONFIG_FILENAME`] and [`BACKBONE_WEIGHTS_FILENAME`]. When `num_classes`
    /// differs from the native class count the classifier is re-initialized.
    ///
    /// # Errors
    /// Returns [`EdgeError::UnknownBackbone`] if the identifier does not resolve, or a load
    /// error if the weights are unreadable or malformed.
    pub fn load(model_id: &str, ctx: &DeviceContext, num_classes: Option<usize>) -> Result<Self> {
        let device = ctx.device();
        let (config, weights) = if let Some(config) = BackboneConfig::builtin(model_id) {
            let weights = init_weights(model_id, &config, device)?;
            (config, weights)
        } else {
            let dir = Path::new(model_id);
            let config_path = dir.join(BACKBONE_CONFIG_FILENAME);
            let weights_path = dir.join(BACKBONE_WEIGHTS_FILENAME);
            if !config_path.is_file() || !weights_path.is_file() {
                return Err(EdgeError::UnknownBackbone {
                    model_id: model_id.to_string(),
                });
            }
            let config: BackboneConfig =
                serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
            config.validate()?;
            let weights = candle_core::safetensors::load(&weights_path, device)
                .map_err(|e| EdgeError::WeightLoad(format!("{}: {e}", weights_path.display())))?;
            (config, weights)
        };

        info!(model_id, classes = config.num_classes, "loading backbone");
        let mut model = Self::from_weights(model_id, config, weights, device)?;
        if let Some(requested) = num_classes {
            if requested != model.config.num_classes {
                model.reset_classifier(requested)?;
            }
        }
        Ok(model)
    }

    fn from_weights(
        model_id: &str,
        config: BackboneConfig,
        weights: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, device);
        let (stem, layers) = build_layers(&config, &vb)
            .map_err(|e| EdgeError::WeightLoad(format!("{model_id}: {e}")))?;
        Ok(Self {
            model_id: model_id.to_string(),
            config,
            stem,
            layers,
            weights,
            device: device.clone(),
        })
    }

    /// Replace the classifier with a freshly initialized head of `num_classes` outputs.
    fn reset_classifier(&mut self, num_classes: usize) -> Result<()> {
        if num_classes == 0 {
            return Err(EdgeError::InvalidConfig("num_classes must be > 0".into()));
        }
        warn!(
            native = self.config.num_classes,
            requested = num_classes,
            "class count differs from backbone, re-initializing classifier"
        );
        let hidden_size = self.config.hidden_size;
        let shapes = frozen_tensors(
            |vb| linear(hidden_size, num_classes, vb.pp("classifier")).map(|_| ()),
            &self.device,
        )?;
        let seed = format!("{}/classes={num_classes}", self.model_id);
        let fresh = seeded_like(&shapes, &seed, &self.device)?;
        self.weights.extend(fresh);
        self.config.num_classes = num_classes;
        let vb = VarBuilder::from_tensors(self.weights.clone(), DType::F32, &self.device);
        let classifier = linear(self.config.hidden_size, num_classes, vb.pp("classifier"))?;
        if let Some(last) = self.layers.last_mut() {
            last.1 = classifier;
        }
        Ok(())
    }

    /// Persist the backbone as a model directory loadable by [`Self::load`].
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(BACKBONE_CONFIG_FILENAME),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        candle_core::safetensors::save(&self.weights, dir.join(BACKBONE_WEIGHTS_FILENAME))?;
        Ok(())
    }

    /// Forward pass producing logits of shape `[batch, num_classes]`.
    ///
    /// Targeted layers are routed through `deltas`; all others use the base weights.
    ///
    /// # Errors
    /// Returns an error if `pixels` is not `[batch, 3, image_size, image_size]`.
    pub fn forward(&self, pixels: &Tensor, deltas: Option<&dyn LayerDeltas>) -> Result<Tensor> {
        let side = self.config.preprocess.image_size as usize;
        let (batch, channels, height, width) = pixels.dims4()?;
        if channels != 3 || height != side || width != side {
            return Err(EdgeError::ShapeMismatch {
                expected: vec![batch, 3, side, side],
                actual: pixels.dims().to_vec(),
            });
        }

        let features = self.stem.forward(pixels)?.relu()?.mean((2, 3))?;
        let last = self.layers.len() - 1;
        let mut hidden = self.layer_forward(0, &features, deltas)?.relu()?;
        for idx in 1..last {
            let update = self.layer_forward(idx, &hidden, deltas)?.relu()?;
            hidden = (hidden + update)?;
        }
        self.layer_forward(last, &hidden, deltas)
    }

    fn layer_forward(
        &self,
        idx: usize,
        input: &Tensor,
        deltas: Option<&dyn LayerDeltas>,
    ) -> Result<Tensor> {
        let (name, base) = &self.layers[idx];
        match deltas {
            Some(deltas) => deltas.forward_layer(name, input, base),
            None => Ok(base.forward(input)?),
        }
    }

    /// Adapter-targetable layer names in forward order.
    #[must_use]
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Base linear layer by name.
    #[must_use]
    pub fn layer(&self, name: &str) -> Option<&Linear> {
        self.layers
            .iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, linear)| linear)
    }

    /// Backbone identifier this model was loaded from.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Architecture description.
    #[must_use]
    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Input transform.
    #[must_use]
    pub fn preprocessor(&self) -> &Preprocessor {
        &self.config.preprocess
    }

    /// Number of output classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// Device holding the weights.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Total number of frozen parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.weights.values().map(Tensor::elem_count).sum()
    }
}

type Layers = (Conv2d, Vec<(String, Linear)>);

fn build_layers(config: &BackboneConfig, vb: &VarBuilder) -> candle_core::Result<Layers> {
    let conv_cfg = Conv2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    };
    let stem = conv2d(3, config.stem_channels, 3, conv_cfg, vb.pp("stem").pp("conv"))?;

    let mut layers = Vec::with_capacity(config.num_blocks + 2);
    layers.push((
        "proj".to_string(),
        linear(config.stem_channels, config.hidden_size, vb.pp("proj"))?,
    ));
    for i in 0..config.num_blocks {
        let name = format!("blocks.{i}.fc");
        let layer = linear(config.hidden_size, config.hidden_size, vb.pp(&name))?;
        layers.push((name, layer));
    }
    layers.push((
        "classifier".to_string(),
        linear(config.hidden_size, config.num_classes, vb.pp("classifier"))?,
    ));
    Ok((stem, layers))
}

/// Deterministic initialization for built-in backbones.
fn init_weights(
    model_id: &str,
    config: &BackboneConfig,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let shapes = frozen_tensors(|vb| build_layers(config, vb).map(|_| ()), device)?;
    seeded_like(&shapes, model_id, device)
}

/// FNV-1a; stable across processes and toolchains, unlike `DefaultHasher`.
fn stable_hash(parts: &[&str]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

/// Tensors shaped like `shapes`, uniform in `±1/sqrt(fan_in)` and seeded per `(seed, name)`.
///
/// A bias takes the fan-in of its sibling weight.
#[allow(clippy::cast_precision_loss)]
fn seeded_like(
    shapes: &HashMap<String, Tensor>,
    seed: &str,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let fan_in = |name: &str, tensor: &Tensor| -> usize {
        let weight = name
            .strip_suffix("bias")
            .and_then(|prefix| shapes.get(&format!("{prefix}weight")))
            .unwrap_or(tensor);
        weight.dims().iter().skip(1).product::<usize>().max(1)
    };

    let mut out = HashMap::with_capacity(shapes.len());
    for (name, tensor) in shapes {
        let bound = 1.0 / (fan_in(name, tensor) as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(stable_hash(&[seed, name]));
        let values: Vec<f32> = (0..tensor.elem_count())
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        out.insert(name.clone(), Tensor::from_vec(values, tensor.dims(), device)?);
    }
    Ok(out)
}

/// Run `build` against a fresh `VarMap` and return its variables as detached constants.
fn frozen_tensors<F>(build: F, device: &Device) -> Result<HashMap<String, Tensor>>
where
    F: FnOnce(&VarBuilder) -> candle_core::Result<()>,
{
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
    build(&vb)?;
    let vars = var_map
        .data()
        .lock()
        .map_err(|_| EdgeError::WeightLoad("variable map lock poisoned".into()))?;
    Ok(vars
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny() -> Result<BaseModel> {
        BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), None)
    }

    #[test]
    fn test_builtin_layers() -> Result<()> {
        let model = tiny()?;
        assert_eq!(
            model.layer_names(),
            vec!["proj", "blocks.0.fc", "blocks.1.fc", "classifier"]
        );
        assert_eq!(model.num_classes(), 10);
        Ok(())
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let model = tiny()?;
        let input = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu)?;
        let logits = model.forward(&input, None)?;
        assert_eq!(logits.dims(), &[2, 10]);
        Ok(())
    }

    #[test]
    fn test_forward_rejects_wrong_size() -> Result<()> {
        let model = tiny()?;
        let input = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            model.forward(&input, None),
            Err(EdgeError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_same_id_loads_same_backbone() -> Result<()> {
        let input = Tensor::ones((1, 3, 32, 32), DType::F32, &Device::Cpu)?;
        let first = tiny()?.forward(&input, None)?.flatten_all()?.to_vec1::<f32>()?;
        let second = tiny()?.forward(&input, None)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(first, second);

        let remapped = |n| -> Result<Vec<f32>> {
            let model = BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), Some(n))?;
            Ok(model.forward(&input, None)?.flatten_all()?.to_vec1::<f32>()?)
        };
        assert_eq!(remapped(4)?, remapped(4)?);
        Ok(())
    }

    #[test]
    fn test_builtin_ids_differ() -> Result<()> {
        let config = BackboneConfig::builtin("edgenet-tiny").ok_or(EdgeError::UnknownBackbone {
            model_id: "edgenet-tiny".into(),
        })?;
        let a = init_weights("edgenet-tiny", &config, &Device::Cpu)?;
        let b = init_weights("edgenet-other", &config, &Device::Cpu)?;
        let key = "proj.weight";
        assert_ne!(
            a[key].flatten_all()?.to_vec1::<f32>()?,
            b[key].flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_malformed_config_rejected_at_load() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let model = tiny()?;
        model.save(dir.path())?;

        let mut config = model.config().clone();
        config.preprocess.resize_size = config.preprocess.image_size - 1;
        std::fs::write(
            dir.path().join(BACKBONE_CONFIG_FILENAME),
            serde_json::to_string(&config)?,
        )?;

        let path = dir.path().to_string_lossy().to_string();
        let result = BaseModel::load(&path, &DeviceContext::cpu(), None);
        assert!(matches!(result, Err(EdgeError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn test_validate_fields() {
        let mut config = BackboneConfig::builtin("edgenet-small").expect("built-in id");
        assert!(config.validate().is_ok());
        config.hidden_size = 0;
        assert!(matches!(config.validate(), Err(EdgeError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_backbone() {
        let result = BaseModel::load("resnet-9000", &DeviceContext::cpu(), None);
        assert!(matches!(result, Err(EdgeError::UnknownBackbone { .. })));
    }

    #[test]
    fn test_classifier_remap() -> Result<()> {
        let model = BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), Some(3))?;
        assert_eq!(model.num_classes(), 3);
        let input = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu)?;
        assert_eq!(model.forward(&input, None)?.dims(), &[1, 3]);
        Ok(())
    }

    #[test]
    fn test_save_and_reload() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let model = tiny()?;
        model.save(dir.path())?;

        let path = dir.path().to_string_lossy().to_string();
        let reloaded = BaseModel::load(&path, &DeviceContext::cpu(), None)?;
        assert_eq!(reloaded.config(), model.config());

        let input = Tensor::ones((1, 3, 32, 32), DType::F32, &Device::Cpu)?;
        let a = model.forward(&input, None)?.flatten_all()?.to_vec1::<f32>()?;
        let b = reloaded.forward(&input, None)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
