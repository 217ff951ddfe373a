use serde::{Deserialize, Serialize};

use crate::feature_store::{FeatureWindow, WindowSummary};
use crate::features::{Feature, FeatureVector};
use crate::weights::WeightVector;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub raw: f64,
    /// Polarity-adjusted A minus B per feature, before weighting.
    pub differentials: FeatureVector,
    /// weight * differential; these sum to `raw`.
    pub contributions: FeatureVector,
}

pub fn score(window_a: &FeatureWindow, window_b: &FeatureWindow, weights: &WeightVector, decay: f64) -> f64 {
    score_summaries(&window_a.summarize(decay), &window_b.summarize(decay), weights).raw
}

/// Features missing on either side contribute nothing.
pub fn score_summaries(a: &WindowSummary, b: &WindowSummary, weights: &WeightVector) -> ScoreBreakdown {
    let mut out = ScoreBreakdown::default();
    for (feature, weight) in weights.iter() {
        let Some(diff) = differential(feature, &a.means, &b.means) else {
            continue;
        };
        let contribution = weight * diff;
        out.differentials.insert(feature, diff);
        out.contributions.insert(feature, contribution);
        out.raw += contribution;
    }
    if !out.raw.is_finite() {
        return ScoreBreakdown::default();
    }
    out
}

fn differential(feature: Feature, a: &FeatureVector, b: &FeatureVector) -> Option<f64> {
    let va = a.get(&feature)?;
    let vb = b.get(&feature)?;
    let diff = feature.polarity() * (va - vb);
    diff.is_finite().then_some(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(values: &[(Feature, f64)], games: usize) -> FeatureWindow {
        let mut w = FeatureWindow::with_capacity(20);
        for _ in 0..games {
            w.push(values.iter().copied().collect());
        }
        w
    }

    #[test]
    fn stronger_side_scores_positive() {
        let weights = WeightVector::from_pairs([(Feature::ExpectedGoalsFor, 1.0)]).unwrap();
        let a = window(&[(Feature::ExpectedGoalsFor, 1.0)], 3);
        let b = window(&[(Feature::ExpectedGoalsFor, -1.0)], 3);
        let s = score(&a, &b, &weights, 0.85);
        assert!((s - 2.0).abs() < 1e-12);
        assert!(score(&b, &a, &weights, 0.85) < 0.0);
    }

    #[test]
    fn lower_is_better_features_flip_sign() {
        let weights = WeightVector::from_pairs([(Feature::HighDangerAgainst, 1.0)]).unwrap();
        let a = window(&[(Feature::HighDangerAgainst, 8.0)], 3);
        let b = window(&[(Feature::HighDangerAgainst, 12.0)], 3);
        assert!(score(&a, &b, &weights, 1.0) > 0.0);
    }

    #[test]
    fn missing_feature_contributes_zero() {
        let weights = WeightVector::from_pairs([
            (Feature::ExpectedGoalsFor, 0.5),
            (Feature::GoalieGsax, 0.5),
        ])
        .unwrap();
        let a = window(&[(Feature::ExpectedGoalsFor, 3.0), (Feature::GoalieGsax, 1.0)], 3);
        let b = window(&[(Feature::ExpectedGoalsFor, 2.0)], 3);
        let breakdown = score_summaries(&a.summarize(1.0), &b.summarize(1.0), &weights);
        assert!((breakdown.raw - 0.5).abs() < 1e-12);
        assert!(!breakdown.contributions.contains_key(&Feature::GoalieGsax));

        let empty = FeatureWindow::with_capacity(20);
        assert_eq!(score(&empty, &empty, &weights, 0.85), 0.0);
    }

    #[test]
    fn overflowing_differential_is_skipped() {
        let weights = WeightVector::from_pairs([
            (Feature::GoalieGsax, 0.5),
            (Feature::Hits, 0.5),
        ])
        .unwrap();
        let a = window(&[(Feature::GoalieGsax, f64::MAX), (Feature::Hits, 30.0)], 1);
        let b = window(&[(Feature::GoalieGsax, -f64::MAX), (Feature::Hits, 20.0)], 1);
        let breakdown = score_summaries(&a.summarize(1.0), &b.summarize(1.0), &weights);
        assert!(!breakdown.differentials.contains_key(&Feature::GoalieGsax));
        assert!((breakdown.raw - 5.0).abs() < 1e-12);
    }
}
