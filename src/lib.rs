//! # edge-lora
//!
//! Real-time image classification under domain shift with swappable low-rank experts.
//!
//! One frozen backbone stays resident. Each domain (sunny, rain, night, ...) gets a small
//! adapter that is applied at forward time:
//! - **`LoRA`**: `W x + (alpha / r) · B A x`
//! - **`DoRA`**: `m · (W + ΔW) / ‖W + ΔW‖` with a learned per-row magnitude `m`
//!
//! Switching between adapters is a name lookup; it never copies or touches weights. Each
//! prediction carries its entropy as a confusion signal, and a [`PerformanceMonitor`] records
//! latency, memory and accuracy metrics per frame.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use edge_lora::preprocess::load_image;
//! use edge_lora::{AdaptiveClassifier, BaseModel, DeviceContext, LoraConfig};
//!
//! # fn main() -> edge_lora::Result<()> {
//! let ctx = DeviceContext::detect();
//! let base = BaseModel::load("edgenet-small", &ctx, Some(10))?;
//! let mut classifier = AdaptiveClassifier::new(Arc::new(base));
//!
//! let config = LoraConfig { r: 8, alpha: 16.0, ..Default::default() };
//! classifier.add_adapter("rain", &config, false)?;
//! classifier.switch_adapter("rain")?;
//!
//! let image = load_image(Path::new("frame.jpg"))?;
//! let result = classifier.predict(&image)?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The backbone routes each adaptable layer through a [`LayerDeltas`] implementation, so
//! adapters never patch the base model.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod backbone;
pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod factory;
pub mod inference;
pub mod io;
pub mod model;
pub mod monitor;
pub mod preprocess;
pub mod registry;
pub mod session;
pub mod traits;
pub mod uncertainty;

pub use adapters::dora::DoraLayer;
pub use adapters::lora::{AdapterVariant, LoraConfig, LoraInitialization, LoraLayer};
pub use adapters::ExpertLayer;
pub use backbone::{BackboneConfig, BaseModel};
pub use config::EdgeConfig;
pub use dataset::{list_images, ImageFolder, Sample};
pub use device::{Backend, DeviceContext};
pub use error::{EdgeError, Result};
pub use inference::{AdaptiveClassifier, InferenceResult, SharedClassifier, BASE_ONLY_LABEL};
pub use io::{
    load_adapter, load_adapter_config, load_adapter_weights, save_adapter, save_adapter_config,
    save_adapter_weights, SaveLoad, ADAPTER_CONFIG_FILENAME, ADAPTER_DIR_NAME,
    ADAPTER_WEIGHTS_FILENAME,
};
pub use model::{format_parameter_count, DomainAdapter, ModulePattern};
pub use monitor::{
    InferenceRecord, LogFormat, MemoryProbe, PerformanceMonitor, ReportPaths, SessionReport,
};
pub use preprocess::Preprocessor;
pub use registry::{AdapterRegistry, RegistryState};
pub use traits::{Adapter, AdapterConfig, LayerDeltas, Mergeable};
pub use uncertainty::{entropy, Assessment, UncertaintyGate};
