use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::features::Feature;

const SUM_TOLERANCE: f64 = 1e-9;

/// Non-negative per-feature weights summing to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector(BTreeMap<Feature, f64>);

impl Default for WeightVector {
    fn default() -> Self {
        Self(BTreeMap::from([
            (Feature::ExpectedGoalsFor, 0.20),
            (Feature::ExpectedGoalsAgainst, 0.10),
            (Feature::HighDangerFor, 0.12),
            (Feature::HighDangerAgainst, 0.10),
            (Feature::ShotAttemptShare, 0.12),
            (Feature::PowerPlayPct, 0.07),
            (Feature::PenaltyKillPct, 0.07),
            (Feature::GoalieGsax, 0.10),
            (Feature::Hits, 0.03),
            (Feature::Giveaways, 0.03),
            (Feature::Takeaways, 0.03),
            (Feature::RestDays, 0.03),
        ]))
    }
}

impl WeightVector {
    /// Normalises the given weights to sum to 1.0. Bounds are the learner's job.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Feature, f64)>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (feature, w) in pairs {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::Config(format!(
                    "weight for {feature} must be finite and non-negative, got {w}"
                )));
            }
            map.insert(feature, w);
        }
        let sum: f64 = map.values().sum();
        if sum <= 0.0 {
            return Err(EngineError::Config("weights sum to zero".to_string()));
        }
        for w in map.values_mut() {
            *w /= sum;
        }
        Ok(Self(map))
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.0.get(&feature).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        self.0.iter().map(|(f, w)| (*f, *w))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn within_bounds(&self, min_w: f64, max_w: f64) -> bool {
        (self.sum() - 1.0).abs() < 1e-6
            && self
                .0
                .values()
                .all(|w| *w >= min_w - SUM_TOLERANCE && *w <= max_w + SUM_TOLERANCE)
    }

    pub(crate) fn add(&mut self, feature: Feature, delta: f64) {
        if let Some(w) = self.0.get_mut(&feature) {
            *w += delta;
        }
    }

    /// Clip each weight to `[min_w, max_w]`, then rescale to sum 1.0.
    ///
    /// Plain rescaling can push a weight back out of the band, so weights that
    /// would cross a bound are pinned to it and the remainder is spread over
    /// the others. Input clipped into the band only ever needs one direction
    /// of pinning, so this settles in at most `len` passes.
    pub(crate) fn clip_and_renormalize(&mut self, min_w: f64, max_w: f64) {
        for w in self.0.values_mut() {
            *w = w.clamp(min_w, max_w);
        }

        let mut pinned: BTreeMap<Feature, f64> = BTreeMap::new();
        for _ in 0..=self.0.len() {
            let pinned_sum: f64 = pinned.values().sum();
            let free_sum: f64 = self
                .0
                .iter()
                .filter(|(f, _)| !pinned.contains_key(*f))
                .map(|(_, w)| *w)
                .sum();
            if free_sum <= 0.0 {
                break;
            }
            let scale = (1.0 - pinned_sum) / free_sum;

            let mut changed = false;
            for (feature, w) in &self.0 {
                if pinned.contains_key(feature) {
                    continue;
                }
                let v = w * scale;
                if v < min_w {
                    pinned.insert(*feature, min_w);
                    changed = true;
                } else if v > max_w {
                    pinned.insert(*feature, max_w);
                    changed = true;
                }
            }
            if !changed {
                for (feature, w) in self.0.iter_mut() {
                    if !pinned.contains_key(feature) {
                        *w *= scale;
                    }
                }
                break;
            }
        }
        for (feature, w) in pinned {
            self.0.insert(feature, w);
        }
    }
}

/// Per-feature velocity carried between learning steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MomentumState(BTreeMap<Feature, f64>);

impl MomentumState {
    pub fn zeroed(weights: &WeightVector) -> Self {
        Self(weights.iter().map(|(f, _)| (f, 0.0)).collect())
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.0.get(&feature).copied().unwrap_or(0.0)
    }

    /// v = coef * v + gradient; returns the new velocity.
    pub(crate) fn step(&mut self, feature: Feature, coef: f64, gradient: f64) -> f64 {
        let v = self.0.entry(feature).or_insert(0.0);
        *v = coef * *v + gradient;
        *v
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        self.0.iter().map(|(f, v)| (*f, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let w = WeightVector::default();
        assert!((w.sum() - 1.0).abs() < 1e-12);
        assert!(w.within_bounds(0.03, 0.65));
    }

    #[test]
    fn from_pairs_normalises() {
        let w = WeightVector::from_pairs([
            (Feature::ExpectedGoalsFor, 3.0),
            (Feature::Hits, 1.0),
        ])
        .unwrap();
        assert!((w.get(Feature::ExpectedGoalsFor) - 0.75).abs() < 1e-12);
        assert_eq!(w.get(Feature::GoalieGsax), 0.0);
        assert!(WeightVector::from_pairs([(Feature::Hits, -1.0)]).is_err());
    }

    #[test]
    fn projection_respects_both_bounds_and_sum() {
        let mut w = WeightVector::default();
        w.add(Feature::ExpectedGoalsFor, 5.0);
        w.clip_and_renormalize(0.03, 0.65);
        assert!(w.within_bounds(0.03, 0.65), "{w:?}");
        assert!((w.get(Feature::ExpectedGoalsFor) - 0.65).abs() < 1e-9);

        let mut w = WeightVector::default();
        for (f, _) in WeightVector::default().iter() {
            w.add(f, -1.0);
        }
        w.add(Feature::GoalieGsax, 2.0);
        w.clip_and_renormalize(0.03, 0.65);
        assert!(w.within_bounds(0.03, 0.65), "{w:?}");
    }

    #[test]
    fn momentum_accumulates() {
        let mut m = MomentumState::zeroed(&WeightVector::default());
        assert_eq!(m.step(Feature::Hits, 0.8, 0.1), 0.1);
        let v = m.step(Feature::Hits, 0.8, 0.1);
        assert!((v - 0.18).abs() < 1e-12);
    }
}
