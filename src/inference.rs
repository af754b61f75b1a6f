//! Inference engine: frozen backbone plus the registry's active adapter.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Tensor, D};
use image::DynamicImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapters::lora::LoraConfig;
use crate::backbone::BaseModel;
use crate::error::{EdgeError, Result};
use crate::io;
use crate::model::{format_parameter_count, DomainAdapter};
use crate::registry::{AdapterRegistry, RegistryState};
use crate::traits::LayerDeltas;
use crate::uncertainty::entropy;

/// Label used for base-only results.
pub const BASE_ONLY_LABEL: &str = "none";

/// Outcome of one forward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Index of the most probable class
    pub class_index: usize,
    /// Probability of `class_index`
    pub confidence: f32,
    /// Softmax output
    pub probabilities: Vec<f32>,
    /// Shannon entropy of `probabilities`
    pub entropy: f32,
    /// Adapter that produced this result, `None` for base-only
    pub adapter: Option<String>,
}

impl InferenceResult {
    /// Build a result from a probability vector.
    #[must_use]
    pub fn from_probabilities(probabilities: Vec<f32>, adapter: Option<String>) -> Self {
        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (idx, p)| {
                if p > best.1 {
                    (idx, p)
                } else {
                    best
                }
            });
        let entropy = entropy(&probabilities);
        Self {
            class_index,
            confidence: confidence.max(0.0),
            probabilities,
            entropy,
            adapter,
        }
    }

    /// Adapter name, or [`BASE_ONLY_LABEL`].
    #[must_use]
    pub fn adapter_label(&self) -> &str {
        self.adapter.as_deref().unwrap_or(BASE_ONLY_LABEL)
    }
}

impl fmt::Display for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "class {} ({:.2}) entropy {:.4} | {}",
            self.class_index,
            self.confidence,
            self.entropy,
            self.adapter_label()
        )
    }
}

/// Classifier that composes a shared frozen backbone with swappable domain adapters.
///
/// Switching takes `&mut self` and prediction `&self`, so within one thread a switch can
/// never interleave with a forward pass. Use [`SharedClassifier`] across threads.
pub struct AdaptiveClassifier {
    base: Arc<BaseModel>,
    registry: AdapterRegistry<DomainAdapter>,
}

impl AdaptiveClassifier {
    /// Wrap a loaded backbone with an empty registry.
    #[must_use]
    pub fn new(base: Arc<BaseModel>) -> Self {
        Self {
            base,
            registry: AdapterRegistry::new(),
        }
    }

    /// Create and register a freshly initialized adapter.
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterAlreadyExists`] if `name` is taken and `overwrite` is
    /// false, or an error if the configuration is invalid or targets no layer.
    pub fn add_adapter(&mut self, name: &str, config: &LoraConfig, overwrite: bool) -> Result<()> {
        if !overwrite && self.registry.contains_adapter(name) {
            return Err(EdgeError::AdapterAlreadyExists {
                name: name.to_string(),
            });
        }
        let adapter = DomainAdapter::new(&self.base, config.clone())?;
        info!(
            adapter = name,
            variant = %adapter.variant(),
            rank = config.r,
            params = %format_parameter_count(adapter.num_parameters()),
            "adding adapter"
        );
        self.registry.insert(name, adapter, overwrite)?;
        Ok(())
    }

    /// Register an already built adapter.
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterAlreadyExists`] if `name` is taken and `overwrite` is false.
    pub fn insert_adapter(
        &mut self,
        name: &str,
        adapter: DomainAdapter,
        overwrite: bool,
    ) -> Result<()> {
        self.registry.insert(name, adapter, overwrite)?;
        Ok(())
    }

    /// Load an adapter checkpoint directory and register it under `name`.
    ///
    /// # Errors
    /// Returns an error if the checkpoint is unreadable, does not fit the backbone, or the
    /// name is taken without `overwrite`.
    pub fn load_adapter(&mut self, dir: &Path, name: &str, overwrite: bool) -> Result<()> {
        if !overwrite && self.registry.contains_adapter(name) {
            return Err(EdgeError::AdapterAlreadyExists {
                name: name.to_string(),
            });
        }
        let adapter = io::load_adapter(dir, &self.base)?;
        info!(adapter = name, path = %dir.display(), "loaded adapter checkpoint");
        self.insert_adapter(name, adapter, overwrite)
    }

    /// Persist a registered adapter as a checkpoint directory.
    ///
    /// # Errors
    /// Returns an error if the adapter is unknown or writing fails.
    pub fn save_adapter(&self, name: &str, dir: &Path) -> Result<()> {
        io::save_adapter(self.registry.get_adapter(name)?, dir)
    }

    /// Make `name` the active adapter.
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterNotFound`] if `name` is not registered.
    pub fn switch_adapter(&mut self, name: &str) -> Result<()> {
        self.registry.switch_adapter(name)
    }

    /// Return to base-only inference.
    pub fn deactivate(&mut self) {
        self.registry.deactivate();
    }

    /// Unregister an inactive adapter.
    ///
    /// # Errors
    /// Returns an error if the adapter is active or unknown.
    pub fn unload_adapter(&mut self, name: &str) -> Result<DomainAdapter> {
        self.registry.remove_adapter(name)
    }

    /// Sorted adapter names.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<&str> {
        self.registry.adapter_names()
    }

    /// Active adapter name, if any.
    #[must_use]
    pub fn active_adapter_name(&self) -> Option<&str> {
        self.registry.active_adapter_name()
    }

    /// Registry state.
    #[must_use]
    pub fn state(&self) -> RegistryState<'_> {
        self.registry.state()
    }

    /// The adapter registry.
    #[must_use]
    pub fn registry(&self) -> &AdapterRegistry<DomainAdapter> {
        &self.registry
    }

    /// The shared backbone.
    #[must_use]
    pub fn base(&self) -> &Arc<BaseModel> {
        &self.base
    }

    /// Preprocess and classify one image.
    ///
    /// # Errors
    /// Returns an error if preprocessing or the forward pass fails.
    pub fn predict(&self, image: &DynamicImage) -> Result<InferenceResult> {
        let pixels = self
            .base
            .preprocessor()
            .inference(image, self.base.device())?;
        self.predict_tensor(&pixels)
    }

    /// Classify one preprocessed `[1, 3, H, W]` tensor.
    ///
    /// # Errors
    /// Returns an error if the batch size is not 1 or the forward pass fails.
    pub fn predict_tensor(&self, pixels: &Tensor) -> Result<InferenceResult> {
        let batch = pixels.dim(0)?;
        if batch != 1 {
            return Err(EdgeError::DimensionMismatch {
                message: format!("predict expects a batch of 1, got {batch}"),
            });
        }
        let mut results = self.predict_batch(pixels)?;
        results.pop().ok_or_else(|| EdgeError::DimensionMismatch {
            message: "empty batch".into(),
        })
    }

    /// Classify a preprocessed `[N, 3, H, W]` batch with the active adapter.
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn predict_batch(&self, pixels: &Tensor) -> Result<Vec<InferenceResult>> {
        let (adapter_name, deltas) = match self.registry.active_adapter() {
            Some((name, adapter)) => (Some(name), Some(adapter as &dyn LayerDeltas)),
            None => (None, None),
        };

        let pixels = pixels.to_device(self.base.device())?.to_dtype(DType::F32)?;
        let logits = self.base.forward(&pixels, deltas)?.detach();
        let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;

        Ok(probabilities
            .into_iter()
            .map(|row| InferenceResult::from_probabilities(row, adapter_name.map(str::to_string)))
            .collect())
    }

    /// One throwaway forward pass to absorb backend initialization cost.
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn warm_up(&self) -> Result<()> {
        let side = self.base.preprocessor().image_size as usize;
        let pixels = Tensor::zeros((1, 3, side, side), DType::F32, self.base.device())?;
        self.predict_tensor(&pixels)?;
        debug!("warm-up pass complete");
        Ok(())
    }
}

/// Thread-safe handle serializing switches and forward passes through one lock.
#[derive(Clone)]
pub struct SharedClassifier {
    inner: Arc<Mutex<AdaptiveClassifier>>,
}

impl SharedClassifier {
    /// Wrap a classifier.
    #[must_use]
    pub fn new(classifier: AdaptiveClassifier) -> Self {
        Self {
            inner: Arc::new(Mutex::new(classifier)),
        }
    }

    /// Switch the active adapter.
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterNotFound`] if `name` is not registered.
    pub fn switch_adapter(&self, name: &str) -> Result<()> {
        self.inner.lock().switch_adapter(name)
    }

    /// Return to base-only inference.
    pub fn deactivate(&self) {
        self.inner.lock().deactivate();
    }

    /// Classify with whichever adapter is active when the lock is taken.
    ///
    /// # Errors
    /// Returns an error if inference fails.
    pub fn predict(&self, image: &DynamicImage) -> Result<InferenceResult> {
        self.inner.lock().predict(image)
    }

    /// Classify a preprocessed tensor under the lock.
    ///
    /// # Errors
    /// Returns an error if inference fails.
    pub fn predict_tensor(&self, pixels: &Tensor) -> Result<InferenceResult> {
        self.inner.lock().predict_tensor(pixels)
    }

    /// Switch and classify in one critical section.
    ///
    /// # Errors
    /// Returns an error if the switch or inference fails.
    pub fn switch_and_predict(&self, name: &str, pixels: &Tensor) -> Result<InferenceResult> {
        let mut guard = self.inner.lock();
        guard.switch_adapter(name)?;
        guard.predict_tensor(pixels)
    }

    /// Run `f` with exclusive access to the classifier.
    pub fn with<R>(&self, f: impl FnOnce(&mut AdaptiveClassifier) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
