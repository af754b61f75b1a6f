//! Session-level classification metrics.
//!
//! Every function here is pure over its inputs; computing a report twice from the same records
//! gives identical output.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::record::InferenceRecord;

/// Probabilities are clipped to `[EPS, 1 - EPS]` before taking logarithms.
pub const LOG_LOSS_EPSILON: f64 = 1e-15;

/// Precision, recall and F1 for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Class index
    pub class: usize,
    /// `tp / (tp + fp)`, 0 when nothing was predicted as this class
    pub precision: f64,
    /// `tp / (tp + fn)`, 0 when the class never occurs in ground truth
    pub recall: f64,
    /// Harmonic mean of precision and recall
    pub f1: f64,
    /// Ground-truth occurrences
    pub support: usize,
}

/// Counts indexed `[true][predicted]` over `labels`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Sorted ground-truth labels observed in the session
    pub labels: Vec<usize>,
    /// `counts[i][j]`: frames with truth `labels[i]` predicted as `labels[j]`
    pub counts: Vec<Vec<usize>>,
}

/// Aggregate of one session's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Experiment name
    pub experiment: String,
    /// Number of records
    pub frames: usize,
    /// Number of records with ground truth
    pub labelled_frames: usize,
    /// Mean latency, 0 for an empty session
    pub mean_latency_ms: f64,
    /// Mean sampled memory, 0 for an empty session
    pub mean_memory_mb: f64,
    /// Mean entropy, 0 for an empty session
    pub mean_entropy: f64,
    /// Fraction of labelled frames predicted correctly
    pub accuracy: Option<f64>,
    /// Macro-averaged recall over observed ground-truth classes
    pub balanced_accuracy: Option<f64>,
    /// Multiclass Matthews correlation coefficient
    pub mcc: Option<f64>,
    /// Mean negative log-likelihood of the true class
    pub log_loss: Option<f64>,
    /// Per-class breakdown over the union of true and predicted labels
    pub per_class: Vec<ClassMetrics>,
    /// Confusion matrix over observed ground-truth labels
    pub confusion: ConfusionMatrix,
}

impl SessionReport {
    /// Compute the report for `records`.
    #[must_use]
    pub fn from_records(experiment: &str, records: &[InferenceRecord]) -> Self {
        let pairs: Vec<(usize, usize)> = records
            .iter()
            .filter_map(|r| r.ground_truth.map(|truth| (truth, r.prediction)))
            .collect();

        Self {
            experiment: experiment.to_string(),
            frames: records.len(),
            labelled_frames: pairs.len(),
            mean_latency_ms: mean(records.iter().map(|r| r.latency_ms)),
            mean_memory_mb: mean(records.iter().map(|r| r.memory_mb)),
            mean_entropy: mean(records.iter().map(|r| f64::from(r.entropy))),
            accuracy: accuracy(&pairs),
            balanced_accuracy: balanced_accuracy(&pairs),
            mcc: matthews_corrcoef(&pairs),
            log_loss: log_loss(records),
            per_class: per_class_metrics(&pairs),
            confusion: confusion_matrix(&pairs),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Fraction of `(truth, prediction)` pairs that agree.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn accuracy(pairs: &[(usize, usize)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let correct = pairs.iter().filter(|(t, p)| t == p).count();
    Some(correct as f64 / pairs.len() as f64)
}

/// Mean per-class recall over the classes present in ground truth.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn balanced_accuracy(pairs: &[(usize, usize)]) -> Option<f64> {
    let mut per_class: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for &(truth, pred) in pairs {
        let entry = per_class.entry(truth).or_default();
        entry.1 += 1;
        if truth == pred {
            entry.0 += 1;
        }
    }
    if per_class.is_empty() {
        return None;
    }
    let total: f64 = per_class
        .values()
        .map(|&(hits, support)| hits as f64 / support as f64)
        .sum();
    Some(total / per_class.len() as f64)
}

/// Multiclass Matthews correlation coefficient.
///
/// Returns `Some(0.0)` when the denominator vanishes (a single class in truth or predictions).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn matthews_corrcoef(pairs: &[(usize, usize)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let mut true_counts: BTreeMap<usize, f64> = BTreeMap::new();
    let mut pred_counts: BTreeMap<usize, f64> = BTreeMap::new();
    let mut correct = 0.0;
    for &(truth, pred) in pairs {
        *true_counts.entry(truth).or_default() += 1.0;
        *pred_counts.entry(pred).or_default() += 1.0;
        if truth == pred {
            correct += 1.0;
        }
    }
    let samples = pairs.len() as f64;
    let labels: BTreeSet<usize> = true_counts.keys().chain(pred_counts.keys()).copied().collect();
    let (mut tp_sum, mut tt_sum, mut pp_sum) = (0.0, 0.0, 0.0);
    for label in labels {
        let t = true_counts.get(&label).copied().unwrap_or(0.0);
        let p = pred_counts.get(&label).copied().unwrap_or(0.0);
        tp_sum += t * p;
        tt_sum += t * t;
        pp_sum += p * p;
    }
    let numerator = correct * samples - tp_sum;
    let denominator = ((samples * samples - pp_sum) * (samples * samples - tt_sum)).sqrt();
    if denominator == 0.0 {
        Some(0.0)
    } else {
        Some(numerator / denominator)
    }
}

/// Mean `-ln p[truth]` over labelled records.
///
/// Falls back to `None`, with a warning, when a ground-truth class has no probability column.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn log_loss(records: &[InferenceRecord]) -> Option<f64> {
    let mut total = 0.0;
    let mut count = 0usize;
    for record in records {
        let Some(truth) = record.ground_truth else {
            continue;
        };
        let Some(&p) = record.probabilities.get(truth) else {
            warn!(
                class = truth,
                columns = record.probabilities.len(),
                "ground-truth class missing from probability columns, log-loss unavailable"
            );
            return None;
        };
        total -= f64::from(p)
            .clamp(LOG_LOSS_EPSILON, 1.0 - LOG_LOSS_EPSILON)
            .ln();
        count += 1;
    }
    (count > 0).then(|| total / count as f64)
}

/// Precision, recall, F1 and support for every label seen in truth or predictions.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn per_class_metrics(pairs: &[(usize, usize)]) -> Vec<ClassMetrics> {
    let labels: BTreeSet<usize> = pairs.iter().flat_map(|&(t, p)| [t, p]).collect();
    labels
        .into_iter()
        .map(|class| {
            let tp = pairs.iter().filter(|&&(t, p)| t == class && p == class).count();
            let predicted = pairs.iter().filter(|&&(_, p)| p == class).count();
            let support = pairs.iter().filter(|&&(t, _)| t == class).count();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                class,
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Confusion matrix keyed by the sorted set of ground-truth labels.
///
/// Predictions outside that set have no column and are not counted.
#[must_use]
pub fn confusion_matrix(pairs: &[(usize, usize)]) -> ConfusionMatrix {
    let labels: Vec<usize> = pairs
        .iter()
        .map(|&(t, _)| t)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let index: BTreeMap<usize, usize> = labels.iter().enumerate().map(|(i, &l)| (l, i)).collect();
    let mut counts = vec![vec![0; labels.len()]; labels.len()];
    for (truth, pred) in pairs {
        if let (Some(&i), Some(&j)) = (index.get(truth), index.get(pred)) {
            counts[i][j] += 1;
        }
    }
    ConfusionMatrix { labels, counts }
}
