//! Shannon entropy as a per-frame confusion signal.

use serde::{Deserialize, Serialize};

/// Added inside the logarithm so zero probabilities contribute zero.
pub const ENTROPY_EPSILON: f64 = 1e-9;

/// Default entropy threshold separating confident from confused frames.
pub const DEFAULT_ENTROPY_THRESHOLD: f32 = 1.0;

/// `-Σ p_i · ln(p_i + ε)` over a probability vector.
///
/// Accumulates in `f64`. Equals `ln(N)` for a uniform distribution over `N` classes and
/// tends to zero for a one-hot distribution.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn entropy(probabilities: &[f32]) -> f32 {
    let sum: f64 = probabilities
        .iter()
        .map(|&p| {
            let p = f64::from(p);
            p * (p + ENTROPY_EPSILON).ln()
        })
        .sum();
    (-sum).max(0.0) as f32
}

/// Verdict for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assessment {
    /// Entropy below the threshold
    Confident,
    /// Entropy at or above the threshold; the active expert may not match the input domain
    Confused,
}

/// Threshold gate on entropy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyGate {
    /// Entropy at or above which a frame counts as confused.
    pub threshold: f32,
}

impl UncertaintyGate {
    /// Gate with a custom threshold.
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Classify an entropy value.
    #[must_use]
    pub fn assess(&self, entropy: f32) -> Assessment {
        if entropy < self.threshold {
            Assessment::Confident
        } else {
            Assessment::Confused
        }
    }

    /// Shorthand for `assess(entropy) == Confused`.
    #[must_use]
    pub fn is_confused(&self, entropy: f32) -> bool {
        self.assess(entropy) == Assessment::Confused
    }
}

impl Default for UncertaintyGate {
    fn default() -> Self {
        Self::new(DEFAULT_ENTROPY_THRESHOLD)
    }
}
