//! Batch runners: labelled evaluation, baseline entropy and the switching benchmark.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use serde::Serialize;
use tracing::{info, warn};

use crate::dataset::ImageFolder;
use crate::error::{EdgeError, Result};
use crate::inference::AdaptiveClassifier;
use crate::monitor::PerformanceMonitor;
use crate::preprocess::load_image;
use crate::uncertainty::{Assessment, UncertaintyGate};

/// Per-frame budget for 30 FPS.
pub const REAL_TIME_BUDGET_MS: f64 = 33.0;

/// Counts from [`evaluate_folder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvaluationSummary {
    /// Images predicted and recorded
    pub evaluated: usize,
    /// Images that could not be decoded
    pub skipped: usize,
}

/// Predict every image of `folder` with the active adapter, one monitor frame per image.
///
/// Unreadable images are logged and skipped.
///
/// # Errors
/// Returns an error if inference fails on a decoded image.
pub fn evaluate_folder(
    classifier: &AdaptiveClassifier,
    folder: &ImageFolder,
    monitor: &mut PerformanceMonitor,
) -> Result<EvaluationSummary> {
    let mut summary = EvaluationSummary {
        evaluated: 0,
        skipped: 0,
    };
    for sample in folder.samples() {
        let image = match load_image(&sample.path) {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "skipping unreadable image");
                summary.skipped += 1;
                continue;
            }
        };
        monitor.start_frame();
        let result = classifier.predict(&image)?;
        monitor.end_frame(Some(sample.label), &result)?;
        summary.evaluated += 1;
    }
    info!(
        adapter = classifier.active_adapter_name().unwrap_or("none"),
        evaluated = summary.evaluated,
        skipped = summary.skipped,
        "folder evaluation complete"
    );
    Ok(summary)
}

/// Mean entropy over a set of images, with the gate's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntropySummary {
    /// Images that were classified
    pub images: usize,
    /// Mean entropy
    pub mean_entropy: f32,
    /// Verdict for `mean_entropy`
    pub assessment: Assessment,
}

/// Classify `paths` and summarize the entropy of the predictions.
///
/// Returns `None` when no image could be classified.
///
/// # Errors
/// Returns an error if inference fails on a decoded image.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn mean_entropy(
    classifier: &AdaptiveClassifier,
    paths: &[PathBuf],
    gate: &UncertaintyGate,
) -> Result<Option<EntropySummary>> {
    let mut total = 0.0f64;
    let mut images = 0usize;
    for path in paths {
        let image = match load_image(path) {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "skipping unreadable image");
                continue;
            }
        };
        total += f64::from(classifier.predict(&image)?.entropy);
        images += 1;
    }
    if images == 0 {
        return Ok(None);
    }
    let mean_entropy = (total / images as f64) as f32;
    Ok(Some(EntropySummary {
        images,
        mean_entropy,
        assessment: gate.assess(mean_entropy),
    }))
}

/// Result of [`benchmark_switching`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchmarkReport {
    /// Timed switch+predict iterations
    pub iterations: usize,
    /// Wall time for all iterations
    pub total: Duration,
    /// Mean switch+predict latency
    pub avg_latency_ms: f64,
    /// `1000 / avg_latency_ms`
    pub projected_fps: f64,
    /// Whether `avg_latency_ms` is under [`REAL_TIME_BUDGET_MS`]
    pub real_time: bool,
}

/// Cycle through `adapters`, switching before every prediction on `pixels`.
///
/// One untimed warm-up pass on the first adapter runs first. Every timed iteration is also
/// recorded as a monitor frame.
///
/// # Errors
/// Returns an error if `adapters` is empty, an adapter is not registered, or inference fails.
#[allow(clippy::cast_precision_loss)]
pub fn benchmark_switching(
    classifier: &mut AdaptiveClassifier,
    adapters: &[&str],
    iterations: usize,
    pixels: &Tensor,
    monitor: &mut PerformanceMonitor,
) -> Result<BenchmarkReport> {
    let first = adapters
        .first()
        .ok_or_else(|| EdgeError::InvalidConfig("benchmark needs at least one adapter".into()))?;
    if iterations == 0 {
        return Err(EdgeError::InvalidConfig("iterations must be > 0".into()));
    }
    classifier.switch_adapter(first)?;
    classifier.predict_tensor(pixels)?;

    let start = Instant::now();
    for name in adapters.iter().cycle().take(iterations) {
        monitor.start_frame();
        classifier.switch_adapter(name)?;
        let result = classifier.predict_tensor(pixels)?;
        monitor.end_frame(None, &result)?;
    }
    let total = start.elapsed();

    let avg_latency_ms = total.as_secs_f64() * 1000.0 / iterations as f64;
    let projected_fps = if avg_latency_ms > 0.0 {
        1000.0 / avg_latency_ms
    } else {
        f64::INFINITY
    };
    let report = BenchmarkReport {
        iterations,
        total,
        avg_latency_ms,
        projected_fps,
        real_time: avg_latency_ms < REAL_TIME_BUDGET_MS,
    };
    if report.real_time {
        info!(avg_latency_ms, projected_fps, "switching is real-time capable");
    } else {
        warn!(
            avg_latency_ms,
            budget_ms = REAL_TIME_BUDGET_MS,
            "switch+inference latency above real-time budget"
        );
    }
    Ok(report)
}
