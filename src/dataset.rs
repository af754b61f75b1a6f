//! Image folder scanning.
//!
//! A labelled dataset is a directory of class subdirectories; the class index is the position
//! of the subdirectory name in sorted order.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;

/// File extensions treated as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// One labelled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Image file
    pub path: PathBuf,
    /// Class index
    pub label: usize,
}

/// Labelled images grouped by class subdirectory.
#[derive(Debug, Clone, Default)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<Sample>,
}

impl ImageFolder {
    /// Index `root/<class>/<image>`.
    ///
    /// # Errors
    /// Returns an error if `root` or a class directory cannot be read.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut classes: Vec<String> = fs::read_dir(root)?
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        classes.sort();

        let mut samples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            for path in list_images(&root.join(class))? {
                samples.push(Sample { path, label });
            }
        }
        info!(
            root = %root.display(),
            classes = classes.len(),
            images = samples.len(),
            "scanned image folder"
        );

        Ok(Self {
            root: root.to_path_buf(),
            classes,
            samples,
        })
    }

    /// Dataset root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Class names in label order.
    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// All samples, class by class.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no image was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sorted image files directly inside `dir`.
///
/// # Errors
/// Returns an error if `dir` cannot be read.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    images.sort();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}
