//! Per-frame observations.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::inference::InferenceResult;

/// One bracketed `predict` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    /// Wall-clock time the frame ended
    pub timestamp: DateTime<Local>,
    /// Experiment this record belongs to
    pub experiment: String,
    /// Adapter active for the prediction, `"none"` for base-only
    pub adapter: String,
    /// Time between `start_frame` and `end_frame`
    pub latency_ms: f64,
    /// Peak memory sampled at `end_frame`
    pub memory_mb: f64,
    /// Entropy of `probabilities`
    pub entropy: f32,
    /// Labelled class, if known
    pub ground_truth: Option<usize>,
    /// Predicted class index
    pub prediction: usize,
    /// Probability of `prediction`
    pub confidence: f32,
    /// Full probability vector
    pub probabilities: Vec<f32>,
}

impl InferenceRecord {
    /// Build a record from an inference result and the frame measurements.
    #[must_use]
    pub fn new(
        experiment: &str,
        ground_truth: Option<usize>,
        result: &InferenceResult,
        latency_ms: f64,
        memory_mb: f64,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            experiment: experiment.to_string(),
            adapter: result.adapter_label().to_string(),
            latency_ms,
            memory_mb,
            entropy: result.entropy,
            ground_truth,
            prediction: result.class_index,
            confidence: result.confidence,
            probabilities: result.probabilities.clone(),
        }
    }

    /// `Some(prediction == ground_truth)` for labelled frames.
    #[must_use]
    pub fn correct(&self) -> Option<bool> {
        self.ground_truth.map(|truth| truth == self.prediction)
    }

    /// Root-mean-square distance between the probability vector and the one-hot ground truth.
    ///
    /// `None` for unlabelled frames or labels outside the probability vector.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn calibration_rmse(&self) -> Option<f64> {
        let truth = self.ground_truth?;
        if truth >= self.probabilities.len() {
            return None;
        }
        let sum: f64 = self
            .probabilities
            .iter()
            .enumerate()
            .map(|(idx, &p)| {
                let target = if idx == truth { 1.0 } else { 0.0 };
                (f64::from(p) - target).powi(2)
            })
            .sum();
        Some((sum / self.probabilities.len() as f64).sqrt())
    }
}

/// Row of the basic CSV log.
#[derive(Debug, Serialize)]
pub(crate) struct BasicRow<'a> {
    timestamp: String,
    experiment: &'a str,
    adapter_active: &'a str,
    latency_ms: String,
    vram_mb: String,
    entropy: String,
    ground_truth: Option<usize>,
    prediction: usize,
    correct: Option<u8>,
}

impl<'a> From<&'a InferenceRecord> for BasicRow<'a> {
    fn from(record: &'a InferenceRecord) -> Self {
        Self {
            timestamp: record.timestamp.to_rfc3339(),
            experiment: &record.experiment,
            adapter_active: &record.adapter,
            latency_ms: format!("{:.2}", record.latency_ms),
            vram_mb: format!("{:.2}", record.memory_mb),
            entropy: format!("{:.4}", record.entropy),
            ground_truth: record.ground_truth,
            prediction: record.prediction,
            correct: record.correct().map(u8::from),
        }
    }
}

/// Row of the strict CSV log.
#[derive(Debug, Serialize)]
pub(crate) struct StrictRow<'a> {
    timestamp: String,
    adapter: &'a str,
    latency_ms: String,
    vram_mb: String,
    entropy: String,
    true_label: Option<usize>,
    pred_label: usize,
    confidence: String,
    rmse_calibration: Option<String>,
    probs: String,
    correct: Option<u8>,
}

impl<'a> From<&'a InferenceRecord> for StrictRow<'a> {
    fn from(record: &'a InferenceRecord) -> Self {
        let probs = record
            .probabilities
            .iter()
            .map(|p| format!("{p:.6}"))
            .collect::<Vec<_>>()
            .join(";");
        Self {
            timestamp: record.timestamp.to_rfc3339(),
            adapter: &record.adapter,
            latency_ms: format!("{:.3}", record.latency_ms),
            vram_mb: format!("{:.2}", record.memory_mb),
            entropy: format!("{:.6}", record.entropy),
            true_label: record.ground_truth,
            pred_label: record.prediction,
            confidence: format!("{:.6}", record.confidence),
            rmse_calibration: record.calibration_rmse().map(|v| format!("{v:.6}")),
            probs,
            correct: record.correct().map(u8::from),
        }
    }
}
