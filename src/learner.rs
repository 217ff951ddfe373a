use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LearnerConfig;
use crate::error::{EngineError, Result};
use crate::features::Feature;
use crate::ledger::PredictionRecord;
use crate::weights::{MomentumState, WeightVector};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    Unresolved,
    TooFewResolved { have: usize, need: usize },
    NonFiniteError,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearnOutcome {
    Applied { error: f64, rate: f64, version: u64 },
    Skipped(SkipReason),
}

impl LearnOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, LearnOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerState {
    pub weights: WeightVector,
    pub momentum: MomentumState,
    pub version: u64,
    pub applied: u64,
    pub skipped: u64,
}

/// Momentum-smoothed weight correction applied once per resolved prediction.
#[derive(Debug, Clone)]
pub struct OnlineLearner {
    cfg: LearnerConfig,
    state: LearnerState,
}

impl OnlineLearner {
    pub fn new(cfg: LearnerConfig) -> Result<Self> {
        let mut weights = match &cfg.initial_weights {
            Some(w) => WeightVector::from_pairs(w.iter().map(|(f, v)| (*f, *v)))?,
            None => WeightVector::default(),
        };
        weights.clip_and_renormalize(cfg.min_weight, cfg.max_weight);
        let momentum = MomentumState::zeroed(&weights);
        Ok(Self {
            cfg,
            state: LearnerState {
                weights,
                momentum,
                version: 0,
                applied: 0,
                skipped: 0,
            },
        })
    }

    pub fn from_state(cfg: LearnerConfig, state: LearnerState) -> Result<Self> {
        if !state.weights.within_bounds(cfg.min_weight, cfg.max_weight) {
            return Err(EngineError::Persistence(format!(
                "stored weights violate bounds [{}, {}] or do not sum to 1",
                cfg.min_weight, cfg.max_weight
            )));
        }
        Ok(Self { cfg, state })
    }

    pub fn weights(&self) -> &WeightVector {
        &self.state.weights
    }

    pub fn momentum(&self) -> &MomentumState {
        &self.state.momentum
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn state(&self) -> &LearnerState {
        &self.state
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.cfg
    }

    pub fn effective_rate(&self, recent_accuracy: Option<f64>) -> f64 {
        match recent_accuracy {
            Some(acc) if self.cfg.adaptive_rate && acc.is_finite() => {
                self.cfg.learning_rate * ((1.0 - acc) / 0.5).clamp(0.5, 1.5)
            }
            _ => self.cfg.learning_rate,
        }
    }

    /// Apply one correction for a resolved record.
    ///
    /// `resolved_in_context` counts resolved records sharing the record's
    /// context, this one included. Weights and momentum change together or
    /// not at all.
    pub fn update(
        &mut self,
        record: &PredictionRecord,
        resolved_in_context: usize,
        recent_accuracy: Option<f64>,
    ) -> LearnOutcome {
        let outcome = self.try_update(record, resolved_in_context, recent_accuracy);
        match outcome {
            LearnOutcome::Applied { error, rate, version } => {
                self.state.applied += 1;
                info!(
                    record = %record.id,
                    error,
                    rate,
                    version,
                    "weights updated"
                );
            }
            LearnOutcome::Skipped(reason) => {
                self.state.skipped += 1;
                debug!(record = %record.id, ?reason, "learning step skipped");
            }
        }
        outcome
    }

    fn try_update(
        &mut self,
        record: &PredictionRecord,
        resolved_in_context: usize,
        recent_accuracy: Option<f64>,
    ) -> LearnOutcome {
        let Some(a_won) = record.a_won() else {
            return LearnOutcome::Skipped(SkipReason::Unresolved);
        };
        if resolved_in_context < self.cfg.min_resolved {
            return LearnOutcome::Skipped(SkipReason::TooFewResolved {
                have: resolved_in_context,
                need: self.cfg.min_resolved,
            });
        }

        let actual = if a_won { 1.0 } else { 0.0 };
        let error = actual - record.probability_a;
        if !error.is_finite() {
            return LearnOutcome::Skipped(SkipReason::NonFiniteError);
        }
        let rate = self.effective_rate(recent_accuracy);

        let mut weights = self.state.weights.clone();
        let mut momentum = self.state.momentum.clone();
        let features = weights.iter().map(|(f, _)| f).collect::<Vec<Feature>>();
        for feature in features {
            let diff = record.differentials.get(&feature).copied().unwrap_or(0.0);
            let gradient = error * contribution_sign(diff) * rate;
            let velocity = momentum.step(feature, self.cfg.momentum, gradient);
            weights.add(feature, velocity);
        }
        weights.clip_and_renormalize(self.cfg.min_weight, self.cfg.max_weight);

        self.state.weights = weights;
        self.state.momentum = momentum;
        self.state.version += 1;
        LearnOutcome::Applied {
            error,
            rate,
            version: self.state.version,
        }
    }
}

// Sign only: magnitudes differ wildly across features (hits vs percentages).
fn contribution_sign(diff: f64) -> f64 {
    if diff > 0.0 {
        1.0
    } else if diff < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_store::WindowSummary;
    use crate::features::{Context, EntityId, FeatureVector};
    use crate::ledger::{RecordId, Resolution, Side};

    fn resolved(p_a: f64, winner: Side, diffs: &[(Feature, f64)]) -> PredictionRecord {
        PredictionRecord {
            id: RecordId(1),
            entity_a: EntityId::parse("A").unwrap(),
            entity_b: EntityId::parse("B").unwrap(),
            context: Context::Home,
            created_at: chrono::Utc::now(),
            summary_a: WindowSummary::default(),
            summary_b: WindowSummary::default(),
            differentials: diffs.iter().copied().collect::<FeatureVector>(),
            raw_score: 0.0,
            primary_probability: p_a,
            probability_a: p_a,
            probability_b: 1.0 - p_a,
            weights_version: 0,
            resolution: Some(Resolution {
                winner,
                resolved_at: chrono::Utc::now(),
                sequence: 1,
            }),
        }
    }

    fn learner() -> OnlineLearner {
        let cfg = LearnerConfig {
            adaptive_rate: false,
            ..LearnerConfig::default()
        };
        OnlineLearner::new(cfg).unwrap()
    }

    #[test]
    fn upset_shrinks_weights_that_favoured_loser() {
        let mut l = learner();
        let before = l.weights().clone();
        let rec = resolved(
            0.7,
            Side::B,
            &[(Feature::ExpectedGoalsFor, 0.8), (Feature::GoalieGsax, -0.4)],
        );
        let out = l.update(&rec, 3, None);
        assert!(out.is_applied());
        assert!(l.weights().get(Feature::ExpectedGoalsFor) < before.get(Feature::ExpectedGoalsFor));
        assert!(l.weights().get(Feature::GoalieGsax) > before.get(Feature::GoalieGsax));
        assert!((l.weights().sum() - 1.0).abs() < 1e-9);
        assert!(l.weights().within_bounds(0.03, 0.65));
        assert_eq!(l.version(), 1);
    }

    #[test]
    fn early_outcomes_are_skipped_but_counted() {
        let mut l = learner();
        let before = l.weights().clone();
        let rec = resolved(0.7, Side::B, &[(Feature::ExpectedGoalsFor, 0.8)]);
        let out = l.update(&rec, 2, None);
        assert_eq!(
            out,
            LearnOutcome::Skipped(SkipReason::TooFewResolved { have: 2, need: 3 })
        );
        assert_eq!(l.weights(), &before);
        assert_eq!(l.state().skipped, 1);
        assert_eq!(l.version(), 0);
    }

    #[test]
    fn momentum_carries_into_next_step() {
        let mut l = learner();
        let rec = resolved(0.7, Side::B, &[(Feature::ExpectedGoalsFor, 0.8)]);
        l.update(&rec, 5, None);
        let v1 = l.momentum().get(Feature::ExpectedGoalsFor);
        assert!(v1 < 0.0);

        // no signal this time: velocity decays but still moves the weight
        let quiet = resolved(0.5, Side::A, &[]);
        let w_before = l.weights().get(Feature::ExpectedGoalsFor);
        l.update(&quiet, 6, None);
        let v2 = l.momentum().get(Feature::ExpectedGoalsFor);
        assert!((v2 - 0.8 * v1).abs() < 1e-12);
        assert!(l.weights().get(Feature::ExpectedGoalsFor) < w_before);
    }

    #[test]
    fn weights_stay_bounded_over_long_runs() {
        let mut l = learner();
        for i in 0..500 {
            let winner = if i % 3 == 0 { Side::A } else { Side::B };
            let rec = resolved(
                0.9,
                winner,
                &[(Feature::ExpectedGoalsFor, 1.0), (Feature::Hits, -2.0)],
            );
            l.update(&rec, 10, None);
            assert!(l.weights().within_bounds(0.03, 0.65), "step {i}: {:?}", l.weights());
        }
    }

    #[test]
    fn adaptive_rate_speeds_up_when_recent_form_is_poor() {
        let l = OnlineLearner::new(LearnerConfig::default()).unwrap();
        let base = l.config().learning_rate;
        assert!((l.effective_rate(None) - base).abs() < 1e-12);
        assert!((l.effective_rate(Some(0.5)) - base).abs() < 1e-12);
        assert!(l.effective_rate(Some(0.3)) > base);
        assert!(l.effective_rate(Some(0.9)) < base);
    }
}
