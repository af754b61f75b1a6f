//! Compute backend selection.
//!
//! The backend is chosen once, by an explicit [`DeviceContext`] that is handed to
//! [`crate::backbone::BaseModel::load`]. Priority: CUDA, then Metal, then CPU.

use std::fmt;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EdgeError, Result};

/// Compute backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Dedicated NVIDIA accelerator
    Cuda,
    /// Integrated Apple accelerator
    Metal,
    /// General-purpose processor
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

/// Explicit initialization context carrying the selected device.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    device: Device,
    backend: Backend,
}

impl DeviceContext {
    /// Walk the fixed priority chain and take the first backend that initializes.
    #[must_use]
    pub fn detect() -> Self {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(device) => return Self::selected(device, Backend::Cuda),
                Err(e) => warn!(error = %e, "cuda reported available but failed to initialize"),
            }
        }
        if candle_core::utils::metal_is_available() {
            match Device::new_metal(0) {
                Ok(device) => return Self::selected(device, Backend::Metal),
                Err(e) => warn!(error = %e, "metal reported available but failed to initialize"),
            }
        }
        Self::selected(Device::Cpu, Backend::Cpu)
    }

    /// CPU-only context.
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            backend: Backend::Cpu,
        }
    }

    /// Build a context for an explicitly requested backend.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be initialized.
    pub fn with_backend(backend: Backend) -> Result<Self> {
        let device = match backend {
            Backend::Cuda => Device::new_cuda(0)?,
            Backend::Metal => Device::new_metal(0)?,
            Backend::Cpu => Device::Cpu,
        };
        Ok(Self::selected(device, backend))
    }

    /// Parse a device name as used in `training.device` (`auto`, `cuda`, `mps`/`metal`, `cpu`).
    ///
    /// # Errors
    /// Returns an error for unrecognized names or unavailable backends.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::detect()),
            "cuda" => Self::with_backend(Backend::Cuda),
            "mps" | "metal" => Self::with_backend(Backend::Metal),
            "cpu" => Ok(Self::cpu()),
            other => Err(EdgeError::InvalidConfig(format!(
                "unknown device '{other}' (expected auto, cuda, mps, metal or cpu)"
            ))),
        }
    }

    fn selected(device: Device, backend: Backend) -> Self {
        info!(%backend, "selected compute backend");
        Self { device, backend }
    }

    /// The candle device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The selected backend kind.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::cpu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_context() {
        let ctx = DeviceContext::cpu();
        assert_eq!(ctx.backend(), Backend::Cpu);
        assert!(ctx.device().is_cpu());
    }

    #[test]
    fn test_detect_is_deterministic() {
        assert_eq!(DeviceContext::detect().backend(), DeviceContext::detect().backend());
    }

    #[test]
    fn test_from_name() -> Result<()> {
        assert_eq!(DeviceContext::from_name("CPU")?.backend(), Backend::Cpu);
        assert!(DeviceContext::from_name("tpu").is_err());
        Ok(())
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(Backend::Metal.to_string(), "metal");
    }
}
