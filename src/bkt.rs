//! Bayesian Knowledge Tracing.

use serde::{Deserialize, Serialize};

/// Fixed BKT model parameters, all probabilities in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BktParams {
    pub initial: f64,
    pub learning_rate: f64,
    pub guess: f64,
    pub slip: f64,
}

impl Default for BktParams {
    fn default() -> Self {
        Self {
            initial: 0.1,
            learning_rate: 0.3,
            guess: 0.2,
            slip: 0.1,
        }
    }
}

/// Runs the recursive BKT update over `outcomes` in chronological order and
/// returns the probability of mastery. An empty sequence yields `params.initial`.
pub fn estimate<I>(params: &BktParams, outcomes: I) -> f64
where
    I: IntoIterator<Item = bool>,
{
    outcomes
        .into_iter()
        .fold(params.initial, |p, correct| step(params, p, correct))
}

fn step(params: &BktParams, p: f64, correct: bool) -> f64 {
    learn(params, observe(params, p, correct))
}

/// Bayes update of `p` given one graded answer.
pub fn observe(params: &BktParams, p: f64, correct: bool) -> f64 {
    let (known, unknown) = if correct {
        (p * (1.0 - params.slip), (1.0 - p) * params.guess)
    } else {
        (p * params.slip, (1.0 - p) * (1.0 - params.guess))
    };
    let evidence = known + unknown;
    if evidence > 0.0 {
        known / evidence
    } else {
        p
    }
}

/// Learning transition applied between attempts.
pub fn learn(params: &BktParams, p: f64) -> f64 {
    (p + (1.0 - p) * params.learning_rate).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> BktParams {
        BktParams {
            initial: 0.1,
            learning_rate: 0.3,
            guess: 0.2,
            slip: 0.1,
        }
    }

    #[test]
    fn empty_history_returns_initial() {
        let params = fixed();
        assert_eq!(estimate(&params, std::iter::empty()), params.initial);

        let other = BktParams {
            initial: 0.42,
            ..fixed()
        };
        assert_eq!(estimate(&other, Vec::new()), 0.42);
    }

    #[test]
    fn single_correct_matches_hand_computation() {
        let params = fixed();
        // posterior = 0.09 / (0.09 + 0.18) = 1/3, then learning transition
        let expected = 1.0 / 3.0 + (2.0 / 3.0) * 0.3;
        assert!((estimate(&params, [true]) - expected).abs() < 1e-12);
    }

    #[test]
    fn all_correct_is_non_decreasing_and_bounded() {
        let params = fixed();
        let mut previous = estimate(&params, std::iter::empty());
        for len in 1..=40 {
            let p = estimate(&params, std::iter::repeat(true).take(len));
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous, "len {len}: {p} < {previous}");
            previous = p;
        }
    }

    #[test]
    fn all_incorrect_evidence_never_raises_mastery() {
        let params = fixed();
        let mut previous = params.initial;
        for len in 1..=40 {
            let p = estimate(&params, std::iter::repeat(false).take(len));
            assert!((0.0..=1.0).contains(&p));
            // the learning transition is the only upward force
            let posterior = observe(&params, previous, false);
            assert!(posterior <= previous, "len {len}: {posterior} > {previous}");
            assert!((learn(&params, posterior) - p).abs() < 1e-12);
            previous = p;
        }
        // settles below the all-correct estimate of the same length
        assert!(previous < estimate(&params, std::iter::repeat(true).take(40)));
    }

    #[test]
    fn correct_answers_outweigh_incorrect() {
        let params = fixed();
        let good = estimate(&params, [true, true, false, true]);
        let bad = estimate(&params, [false, false, true, false]);
        assert!(good > bad);
    }

    #[test]
    fn degenerate_parameters_stay_in_range() {
        let params = BktParams {
            initial: 0.0,
            learning_rate: 0.0,
            guess: 0.0,
            slip: 0.0,
        };
        let p = estimate(&params, [true, false, true]);
        assert!((0.0..=1.0).contains(&p));
    }
}
