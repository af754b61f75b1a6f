//! Image preprocessing for the backbone.
//!
//! Training and inference share the same tensor conversion and normalization; they differ
//! only in the geometric and photometric steps before it. Inference is deterministic.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EdgeError, Result};

/// ImageNet channel means.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Brightness/contrast jitter half-width for training.
const JITTER: f32 = 0.2;

/// Fixed preprocessing transform of a backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    /// Square input side fed to the network.
    pub image_size: u32,
    /// Square side images are resized to before random cropping (training only).
    pub resize_size: u32,
    /// Per-channel normalization mean.
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    /// Per-channel normalization standard deviation.
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN
}

fn default_std() -> [f32; 3] {
    IMAGENET_STD
}

impl Preprocessor {
    /// Preprocessor with ImageNet statistics.
    #[must_use]
    pub fn new(image_size: u32, resize_size: u32) -> Self {
        Self {
            image_size,
            resize_size: resize_size.max(image_size),
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// Check sizes and normalization statistics.
    ///
    /// # Errors
    /// Returns [`EdgeError::InvalidConfig`] if `image_size` is zero, `resize_size` is smaller
    /// than `image_size`, or a standard deviation is not positive.
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(EdgeError::InvalidConfig("image_size must be > 0".into()));
        }
        if self.resize_size < self.image_size {
            return Err(EdgeError::InvalidConfig(format!(
                "resize_size ({}) must be >= image_size ({})",
                self.resize_size, self.image_size
            )));
        }
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(EdgeError::InvalidConfig("std must be positive".into()));
        }
        Ok(())
    }

    /// Deterministic transform: resize to `image_size` and normalize.
    ///
    /// Returns a `[1, 3, image_size, image_size]` tensor.
    ///
    /// # Errors
    /// Returns an error if tensor construction fails.
    pub fn inference(&self, image: &DynamicImage, device: &Device) -> Result<Tensor> {
        let rgb = imageops::resize(
            &image.to_rgb8(),
            self.image_size,
            self.image_size,
            FilterType::Triangle,
        );
        let pixels = self.to_unit_tensor(&rgb, device)?;
        self.normalize(&pixels)
    }

    /// Randomized transform: resize, random crop, random horizontal flip,
    /// brightness/contrast jitter, then the same normalization as [`Self::inference`].
    ///
    /// # Errors
    /// Returns [`EdgeError::InvalidConfig`] if the sizes are inconsistent, or an error if
    /// tensor construction fails.
    pub fn training<R: Rng + ?Sized>(
        &self,
        image: &DynamicImage,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor> {
        self.validate()?;
        let resized = imageops::resize(
            &image.to_rgb8(),
            self.resize_size,
            self.resize_size,
            FilterType::Triangle,
        );
        let slack = self.resize_size - self.image_size;
        let x = rng.gen_range(0..=slack);
        let y = rng.gen_range(0..=slack);
        let mut cropped =
            imageops::crop_imm(&resized, x, y, self.image_size, self.image_size).to_image();
        if rng.gen_bool(0.5) {
            cropped = imageops::flip_horizontal(&cropped);
        }

        let pixels = self.to_unit_tensor(&cropped, device)?;
        let brightness = f64::from(rng.gen_range(1.0 - JITTER..=1.0 + JITTER));
        let contrast = f64::from(rng.gen_range(1.0 - JITTER..=1.0 + JITTER));
        let pixels = pixels.affine(brightness, 0.0)?;
        let mean = pixels.mean_all()?.to_scalar::<f32>()?;
        let pixels = pixels
            .affine(contrast, f64::from(mean) * (1.0 - contrast))?
            .clamp(0f32, 1f32)?;
        self.normalize(&pixels)
    }

    /// HWC u8 -> CHW f32 in `[0, 1]`.
    fn to_unit_tensor(&self, rgb: &RgbImage, device: &Device) -> Result<Tensor> {
        let (width, height) = rgb.dimensions();
        let raw = rgb.as_raw().clone();
        let tensor = Tensor::from_vec(raw, (height as usize, width as usize, 3), device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?;
        Ok(tensor)
    }

    fn normalize(&self, pixels: &Tensor) -> Result<Tensor> {
        let device = pixels.device();
        let mean = Tensor::new(&self.mean, device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&self.std, device)?.reshape((3, 1, 1))?;
        Ok(pixels
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .unsqueeze(0)?)
    }
}

/// Decode an image file.
///
/// # Errors
/// Returns [`EdgeError::Image`] if the file cannot be opened or decoded.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| EdgeError::Image {
        path: path.to_path_buf(),
        source,
    })
}
