//! Deep Knowledge Tracing: feature extraction, cached weights and the forward pass.
//!
//! The network is a single tanh hidden layer over a fixed four-wide feature
//! vector. Weights come from a JSON artifact when one is cached; otherwise a
//! fixed-seed ChaCha stream produces the same parameters on every run.

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EstimationError, WeightLoadError};
use crate::models::{HistoryEntry, Observation};

/// Width of the feature vector. The order of features is part of the weight format.
pub const FEATURE_WIDTH: usize = 4;

/// Number of trailing observations used for the "recent" features.
pub const RECENT_WINDOW: usize = 5;

/// Response times are divided by this many seconds before clamping to [0, 1].
pub const RESPONSE_TIME_SCALE: f64 = 60.0;

pub const DEFAULT_WEIGHT_SEED: u64 = 42;

pub type Features = [f64; FEATURE_WIDTH];

/// Parameters of the sequence estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub input: [[f64; FEATURE_WIDTH]; FEATURE_WIDTH],
    pub output: [f64; FEATURE_WIDTH],
}

/// Where the active weights came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightOrigin {
    Cached,
    Fallback { seed: u64 },
}

/// Artifact shape before validation; lengths are checked by hand so that a
/// short row is reported as corrupt rather than as a serde type error.
#[derive(Deserialize)]
struct RawWeights {
    input: Vec<Vec<f64>>,
    output: Vec<f64>,
}

impl ModelWeights {
    /// Deterministic parameters drawn from `seed`.
    pub fn fallback(seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut input = [[0.0; FEATURE_WIDTH]; FEATURE_WIDTH];
        for row in input.iter_mut() {
            for value in row.iter_mut() {
                *value = rng.gen_range(-0.5..0.5);
            }
        }
        let mut output = [0.0; FEATURE_WIDTH];
        for value in output.iter_mut() {
            *value = rng.gen_range(-0.5..0.5);
        }
        Self { input, output }
    }

    /// Reads a weight artifact from `path`.
    pub fn load(path: &Path) -> Result<Self, WeightLoadError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, WeightLoadError> {
        let raw: RawWeights = serde_json::from_str(content)?;

        if raw.input.len() != FEATURE_WIDTH {
            return Err(WeightLoadError::Corrupt(format!(
                "input has {} rows, expected {FEATURE_WIDTH}",
                raw.input.len()
            )));
        }
        if raw.output.len() != FEATURE_WIDTH {
            return Err(WeightLoadError::Corrupt(format!(
                "output has {} values, expected {FEATURE_WIDTH}",
                raw.output.len()
            )));
        }

        let mut input = [[0.0; FEATURE_WIDTH]; FEATURE_WIDTH];
        for (index, row) in raw.input.iter().enumerate() {
            if row.len() != FEATURE_WIDTH {
                return Err(WeightLoadError::Corrupt(format!(
                    "input row {index} has {} values, expected {FEATURE_WIDTH}",
                    row.len()
                )));
            }
            input[index].copy_from_slice(row);
        }
        let mut output = [0.0; FEATURE_WIDTH];
        output.copy_from_slice(&raw.output);

        let weights = Self { input, output };
        if !weights.is_finite() {
            return Err(WeightLoadError::Corrupt("non-finite parameter".into()));
        }
        Ok(weights)
    }

    /// Loads the cached artifact, or falls back to the seeded parameters.
    /// Never fails.
    pub fn load_or_fallback(path: Option<&Path>, seed: u64) -> (Self, WeightOrigin) {
        let Some(path) = path else {
            tracing::warn!(seed, "no weight artifact configured, using seeded fallback");
            return (Self::fallback(seed), WeightOrigin::Fallback { seed });
        };

        match Self::load(path) {
            Ok(weights) => {
                tracing::info!(path = %path.display(), "loaded cached model weights");
                (weights, WeightOrigin::Cached)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    seed,
                    "model weights unavailable ({e}), using seeded fallback"
                );
                (Self::fallback(seed), WeightOrigin::Fallback { seed })
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn is_finite(&self) -> bool {
        self.input.iter().flatten().all(|v| v.is_finite())
            && self.output.iter().all(|v| v.is_finite())
    }
}

fn normalize_time(seconds: f64) -> f64 {
    (seconds / RESPONSE_TIME_SCALE).clamp(0.0, 1.0)
}

fn check_time(seconds: Option<f64>) -> Result<Option<f64>, EstimationError> {
    match seconds {
        Some(t) if !t.is_finite() || t < 0.0 => Err(EstimationError::InvalidFeature(format!(
            "response time {t} is not a non-negative number"
        ))),
        other => Ok(other),
    }
}

/// Builds the feature vector: recent accuracy, recent mean response time,
/// current correctness, current response time.
pub fn extract_features(
    history: &[HistoryEntry],
    current: &Observation,
) -> Result<Features, EstimationError> {
    let window = &history[history.len().saturating_sub(RECENT_WINDOW)..];

    let recent_accuracy = if window.is_empty() {
        0.5
    } else {
        window.iter().filter(|entry| entry.correct).count() as f64 / window.len() as f64
    };

    let mut timed = Vec::with_capacity(window.len());
    for entry in window {
        if let Some(t) = check_time(entry.response_time)? {
            timed.push(t);
        }
    }
    let recent_time = if timed.is_empty() {
        0.0
    } else {
        normalize_time(timed.iter().sum::<f64>() / timed.len() as f64)
    };

    let current_time = check_time(current.response_time)?
        .map(normalize_time)
        .unwrap_or(0.0);

    Ok([
        recent_accuracy,
        recent_time,
        if current.correct { 1.0 } else { 0.0 },
        current_time,
    ])
}

/// Logistic function with the input clamped to avoid overflow in `exp`.
pub fn sigmoid(x: f64) -> f64 {
    let x = x.clamp(-500.0, 500.0);
    1.0 / (1.0 + (-x).exp())
}

/// `sigmoid(output · tanh(input · features))`.
pub fn forward(weights: &ModelWeights, features: &Features) -> Result<f64, EstimationError> {
    let mut hidden = [0.0; FEATURE_WIDTH];
    for (h, row) in hidden.iter_mut().zip(weights.input.iter()) {
        let activation: f64 = row.iter().zip(features.iter()).map(|(w, x)| w * x).sum();
        *h = activation.tanh();
    }

    let logit: f64 = weights
        .output
        .iter()
        .zip(hidden.iter())
        .map(|(w, h)| w * h)
        .sum();
    let probability = sigmoid(logit);

    if probability.is_finite() {
        Ok(probability)
    } else {
        Err(EstimationError::NonFinite("dkt forward pass"))
    }
}

/// Sequence estimate of mastery in [0, 1].
pub fn estimate(
    weights: &ModelWeights,
    history: &[HistoryEntry],
    current: &Observation,
) -> Result<f64, EstimationError> {
    let features = extract_features(history, current)?;
    forward(weights, &features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;
    use uuid::Uuid;

    fn entry(correct: bool, response_time: Option<f64>) -> HistoryEntry {
        HistoryEntry {
            correct,
            response_time,
            score: None,
            timestamp: Utc::now(),
        }
    }

    fn current(correct: bool, response_time: Option<f64>) -> Observation {
        Observation {
            student_id: Uuid::nil(),
            concept_id: None,
            correct,
            response_time,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn features_for_empty_history() {
        let features = extract_features(&[], &current(true, Some(30.0))).unwrap();
        assert_eq!(features, [0.5, 0.0, 1.0, 0.5]);
    }

    #[test]
    fn features_use_last_five_observations() {
        let history = vec![
            entry(false, Some(60.0)),
            entry(false, Some(60.0)),
            entry(true, Some(10.0)),
            entry(true, Some(20.0)),
            entry(false, None),
            entry(true, Some(30.0)),
            entry(true, Some(20.0)),
        ];
        let features = extract_features(&history, &current(false, Some(120.0))).unwrap();
        assert!((features[0] - 0.8).abs() < 1e-12);
        // mean of 10, 20, 30, 20 seconds
        assert!((features[1] - 20.0 / 60.0).abs() < 1e-12);
        assert_eq!(features[2], 0.0);
        assert_eq!(features[3], 1.0);
    }

    #[test]
    fn negative_response_time_is_rejected() {
        let result = extract_features(&[], &current(true, Some(-4.0)));
        assert!(matches!(result, Err(EstimationError::InvalidFeature(_))));

        let result = extract_features(&[entry(true, Some(f64::NAN))], &current(true, None));
        assert!(matches!(result, Err(EstimationError::InvalidFeature(_))));
    }

    #[test]
    fn sigmoid_saturates_without_overflow() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10_000.0) <= 1.0);
        assert!(sigmoid(-10_000.0) >= 0.0);
        assert!(sigmoid(-10_000.0).is_finite());
    }

    #[test]
    fn forward_with_zero_weights_is_one_half() {
        let weights = ModelWeights {
            input: [[0.0; FEATURE_WIDTH]; FEATURE_WIDTH],
            output: [0.0; FEATURE_WIDTH],
        };
        assert_eq!(forward(&weights, &[1.0, 1.0, 1.0, 1.0]).unwrap(), 0.5);
    }

    #[test]
    fn forward_matches_hand_computation() {
        let mut input = [[0.0; FEATURE_WIDTH]; FEATURE_WIDTH];
        input[0][2] = 1.0;
        let weights = ModelWeights {
            input,
            output: [2.0, 0.0, 0.0, 0.0],
        };
        let expected = sigmoid(2.0 * 1.0f64.tanh());
        let actual = forward(&weights, &[0.0, 0.0, 1.0, 0.0]).unwrap();
        assert!((actual - expected).abs() < 1e-12);
    }

    #[test]
    fn fallback_is_bit_identical_for_same_seed() {
        let a = ModelWeights::fallback(DEFAULT_WEIGHT_SEED);
        let b = ModelWeights::fallback(DEFAULT_WEIGHT_SEED);
        for (x, y) in a.input.iter().flatten().zip(b.input.iter().flatten()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
        for (x, y) in a.output.iter().zip(b.output.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
        assert_ne!(a, ModelWeights::fallback(DEFAULT_WEIGHT_SEED + 1));
        assert!(a.input.iter().flatten().all(|v| (-0.5..0.5).contains(v)));
    }

    #[test]
    fn loads_cached_artifact() {
        let weights = ModelWeights::fallback(7);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(weights.to_json().unwrap().as_bytes()).unwrap();

        let (loaded, origin) = ModelWeights::load_or_fallback(Some(file.path()), 1);
        assert_eq!(origin, WeightOrigin::Cached);
        assert_eq!(loaded, weights);
    }

    #[test]
    fn missing_artifact_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let (weights, origin) = ModelWeights::load_or_fallback(Some(&path), 9);
        assert_eq!(origin, WeightOrigin::Fallback { seed: 9 });
        assert_eq!(weights, ModelWeights::fallback(9));
    }

    #[test]
    fn corrupt_artifacts_fall_back() {
        let cases = [
            "not json",
            r#"{"input": [[0,0,0,0]], "output": [0,0,0,0]}"#,
            r#"{"input": [[0,0,0,0],[0,0,0,0],[0,0,0],[0,0,0,0]], "output": [0,0,0,0]}"#,
            r#"{"input": [[0,0,0,0],[0,0,0,0],[0,0,0,0],[0,0,0,0]], "output": [0,0]}"#,
        ];
        for content in cases {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(content.as_bytes()).unwrap();
            let (_, origin) = ModelWeights::load_or_fallback(Some(file.path()), 3);
            assert_eq!(origin, WeightOrigin::Fallback { seed: 3 }, "{content}");
        }
    }
}
