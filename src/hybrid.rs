//! Hybrid mastery estimation: BKT always, blended with DKT once enough history exists.

use std::sync::Arc;

use uuid::Uuid;

use crate::bkt::{self, BktParams};
use crate::config::EstimationConfig;
use crate::dkt::{self, ModelWeights, WeightOrigin};
use crate::error::EstimationError;
use crate::models::{EstimationMethod, HistoryEntry, MasteryEstimate, Observation};

/// Result of one estimation run.
///
/// `Degraded` carries the fallback score together with the reason the real
/// estimate could not be produced, so callers can tell the two apart.
#[derive(Debug, Clone, PartialEq)]
pub enum Estimate {
    Exact(MasteryEstimate),
    Degraded {
        estimate: MasteryEstimate,
        reason: EstimationError,
    },
}

impl Estimate {
    pub fn score(&self) -> f64 {
        self.estimate().score
    }

    pub fn estimate(&self) -> &MasteryEstimate {
        match self {
            Estimate::Exact(estimate) => estimate,
            Estimate::Degraded { estimate, .. } => estimate,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Estimate::Degraded { .. })
    }
}

/// Blend policy between the two estimators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendPolicy {
    /// DKT is used only when the history is strictly longer than this.
    pub min_history: usize,
    pub dkt_weight: f64,
    pub fallback_score: f64,
}

impl Default for BlendPolicy {
    fn default() -> Self {
        Self {
            min_history: 10,
            dkt_weight: 0.7,
            fallback_score: 50.0,
        }
    }
}

/// Estimator shared by every worker. Read-only after construction.
#[derive(Debug, Clone)]
pub struct MasteryEngine {
    bkt: BktParams,
    policy: BlendPolicy,
    weights: Arc<ModelWeights>,
    origin: WeightOrigin,
}

impl MasteryEngine {
    pub fn new(
        bkt: BktParams,
        policy: BlendPolicy,
        weights: ModelWeights,
        origin: WeightOrigin,
    ) -> Self {
        Self {
            bkt,
            policy,
            weights: Arc::new(weights),
            origin,
        }
    }

    /// Builds the engine from configuration, loading cached weights once.
    pub fn from_config(config: &EstimationConfig) -> Self {
        let (weights, origin) =
            ModelWeights::load_or_fallback(config.weights_path.as_deref(), config.weight_seed);
        let policy = BlendPolicy {
            min_history: config.dkt_min_history,
            dkt_weight: config.dkt_weight.clamp(0.0, 1.0),
            fallback_score: config.fallback_score,
        };
        Self::new(config.bkt_params(), policy, weights, origin)
    }

    pub fn weight_origin(&self) -> WeightOrigin {
        self.origin
    }

    pub fn policy(&self) -> &BlendPolicy {
        &self.policy
    }

    /// Final mastery score in [0, 100] for `current` given the prior `history`.
    /// Never fails; internal errors yield a degraded fallback score.
    pub fn estimate(&self, history: &[HistoryEntry], current: &Observation) -> Estimate {
        match self.try_estimate(history, current) {
            Ok(estimate) => Estimate::Exact(estimate),
            Err(reason) => {
                tracing::warn!(
                    student_id = %current.student_id,
                    "mastery estimate degraded: {reason}"
                );
                Estimate::Degraded {
                    estimate: MasteryEstimate {
                        student_id: current.student_id,
                        score: self.policy.fallback_score,
                        method: EstimationMethod::Fallback,
                        bkt: None,
                        dkt: None,
                    },
                    reason,
                }
            }
        }
    }

    fn try_estimate(
        &self,
        history: &[HistoryEntry],
        current: &Observation,
    ) -> Result<MasteryEstimate, EstimationError> {
        let outcomes = history
            .iter()
            .map(|entry| entry.correct)
            .chain(std::iter::once(current.correct));
        let bkt = bkt::estimate(&self.bkt, outcomes);
        if !bkt.is_finite() {
            return Err(EstimationError::NonFinite("bkt update"));
        }

        let (blended, dkt, method) = if history.len() > self.policy.min_history {
            let dkt = dkt::estimate(&self.weights, history, current)?;
            let w = self.policy.dkt_weight;
            (w * dkt + (1.0 - w) * bkt, Some(dkt), EstimationMethod::Hybrid)
        } else {
            (bkt, None, EstimationMethod::Bkt)
        };

        let score = to_score(blended)?;
        Ok(MasteryEstimate {
            student_id: current.student_id,
            score,
            method,
            bkt: Some(bkt),
            dkt,
        })
    }
}

impl Default for MasteryEngine {
    fn default() -> Self {
        Self::from_config(&EstimationConfig::default())
    }
}

fn to_score(probability: f64) -> Result<f64, EstimationError> {
    if !probability.is_finite() {
        return Err(EstimationError::NonFinite("blend"));
    }
    Ok((probability.clamp(0.0, 1.0) * 100.0).clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn engine() -> MasteryEngine {
        MasteryEngine::new(
            BktParams::default(),
            BlendPolicy::default(),
            ModelWeights::fallback(42),
            WeightOrigin::Fallback { seed: 42 },
        )
    }

    fn history(outcomes: &[bool], response_time: f64) -> Vec<HistoryEntry> {
        outcomes
            .iter()
            .map(|&correct| HistoryEntry {
                correct,
                response_time: Some(response_time),
                score: None,
                timestamp: Utc::now(),
            })
            .collect()
    }

    fn answer(correct: bool, response_time: Option<f64>) -> Observation {
        Observation {
            student_id: Uuid::new_v4(),
            concept_id: Some("fractions".into()),
            correct,
            response_time,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn short_history_uses_bkt_only() {
        let engine = engine();
        for len in 0..=10 {
            let outcomes: Vec<bool> = (0..len).map(|i| i % 3 != 0).collect();
            let past = history(&outcomes, 25.0);
            let current = answer(true, Some(15.0));

            let result = engine.estimate(&past, &current);
            let expected = 100.0
                * bkt::estimate(
                    &BktParams::default(),
                    outcomes.iter().copied().chain([true]),
                );
            assert!(!result.is_degraded());
            assert_eq!(result.estimate().method, EstimationMethod::Bkt);
            assert!((result.score() - expected.clamp(0.0, 100.0)).abs() < 1e-9);
        }
    }

    #[test]
    fn long_history_blends_both_estimators() {
        let engine = engine();
        let outcomes = [true, false, true, true, false, true, true, false, true, true, false];
        let past = history(&outcomes, 40.0);
        let current = answer(true, Some(20.0));

        let result = engine.estimate(&past, &current);
        let bkt = bkt::estimate(&BktParams::default(), outcomes.iter().copied().chain([true]));
        let dkt = dkt::estimate(&ModelWeights::fallback(42), &past, &current).unwrap();
        let expected = 100.0 * (0.7 * dkt + 0.3 * bkt).clamp(0.0, 1.0);

        assert_eq!(result.estimate().method, EstimationMethod::Hybrid);
        assert_eq!(result.estimate().dkt, Some(dkt));
        assert!((result.score() - expected).abs() < 1e-9);
        assert!((0.0..=100.0).contains(&result.score()));
    }

    #[test]
    fn invalid_input_degrades_to_fallback_score() {
        let engine = engine();
        let past = history(&[true; 12], 30.0);
        let current = answer(true, Some(f64::INFINITY));

        let result = engine.estimate(&past, &current);
        assert!(result.is_degraded());
        assert_eq!(result.score(), 50.0);
        assert_eq!(result.estimate().method, EstimationMethod::Fallback);
        match result {
            Estimate::Degraded { reason, .. } => {
                assert!(matches!(reason, EstimationError::InvalidFeature(_)))
            }
            Estimate::Exact(_) => unreachable!(),
        }
    }

    #[test]
    fn short_history_ignores_bad_response_times() {
        // DKT features are not computed below the gate
        let engine = engine();
        let result = engine.estimate(&[], &answer(false, Some(-1.0)));
        assert!(!result.is_degraded());
    }

    #[test]
    fn from_config_without_artifact_uses_seeded_weights() {
        let engine = MasteryEngine::from_config(&EstimationConfig::default());
        assert_eq!(engine.weight_origin(), WeightOrigin::Fallback { seed: 42 });
        assert_eq!(engine.policy().min_history, 10);
    }
}
