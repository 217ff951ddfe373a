use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::calibration::{self, CalibrationBin};
use crate::ledger::{OutcomeLedger, PredictionRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyStats {
    pub total: u64,
    /// Sum over resolved records of the probability given to the actual winner.
    pub correct_confidence_sum: f64,
    pub hits: u64,
    pub brier_sum: f64,
    pub log_loss_sum: f64,
    pub recent: VecDeque<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsView {
    pub total: u64,
    pub overall_accuracy: f64,
    pub recent_accuracy: f64,
    pub recent_samples: usize,
    pub hit_rate: f64,
    pub brier: f64,
    pub log_loss: f64,
}

#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    recent_window: usize,
    stats: AccuracyStats,
}

impl PerformanceTracker {
    pub fn new(recent_window: usize) -> Self {
        let recent_window = recent_window.max(1);
        Self {
            recent_window,
            stats: AccuracyStats {
                total: 0,
                correct_confidence_sum: 0.0,
                hits: 0,
                brier_sum: 0.0,
                log_loss_sum: 0.0,
                recent: VecDeque::with_capacity(recent_window),
            },
        }
    }

    /// Returns the accuracy value appended, or `None` for an unresolved record.
    pub fn record_outcome_accuracy(&mut self, record: &PredictionRecord) -> Option<f64> {
        let a_won = record.a_won()?;
        let accuracy = record.probability_of_winner()?;
        let s = &mut self.stats;

        s.total += 1;
        s.correct_confidence_sum += accuracy;
        if calibration::is_hit(record.probability_a, a_won) {
            s.hits += 1;
        }
        s.brier_sum += calibration::brier(record.probability_a, a_won);
        s.log_loss_sum += calibration::log_loss(record.probability_a, a_won);

        s.recent.push_back(accuracy);
        while s.recent.len() > self.recent_window {
            s.recent.pop_front();
        }
        Some(accuracy)
    }

    pub fn get_stats(&self) -> StatsView {
        let s = &self.stats;
        if s.total == 0 {
            return StatsView::default();
        }
        let n = s.total as f64;
        StatsView {
            total: s.total,
            overall_accuracy: s.correct_confidence_sum / n,
            recent_accuracy: self.recent_accuracy().unwrap_or(0.0),
            recent_samples: s.recent.len(),
            hit_rate: s.hits as f64 / n,
            brier: s.brier_sum / n,
            log_loss: s.log_loss_sum / n,
        }
    }

    pub fn recent_accuracy(&self) -> Option<f64> {
        let recent = &self.stats.recent;
        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    pub fn stats(&self) -> &AccuracyStats {
        &self.stats
    }

    /// Rebuild from scratch in resolution order; matches incremental results exactly.
    pub fn recompute_from_ledger(&mut self, ledger: &OutcomeLedger) {
        *self = Self::new(self.recent_window);
        for record in ledger.resolved_in_order() {
            self.record_outcome_accuracy(record);
        }
    }

    pub fn calibration_bins(ledger: &OutcomeLedger, bins: usize) -> Vec<CalibrationBin> {
        let (preds, outcomes): (Vec<f64>, Vec<bool>) = ledger
            .resolved_in_order()
            .filter_map(|r| r.a_won().map(|won| (r.probability_a, won)))
            .unzip();
        calibration::calibration_bins(&preds, &outcomes, bins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_store::WindowSummary;
    use crate::features::{Context, EntityId, FeatureVector};
    use crate::ledger::{PredictionDraft, Side};

    fn draft(p: f64) -> PredictionDraft {
        PredictionDraft {
            entity_a: EntityId::parse("A").unwrap(),
            entity_b: EntityId::parse("B").unwrap(),
            context: Context::Home,
            summary_a: WindowSummary::default(),
            summary_b: WindowSummary::default(),
            differentials: FeatureVector::new(),
            raw_score: 0.0,
            primary_probability: p,
            probability_a: p,
            weights_version: 0,
        }
    }

    #[test]
    fn accuracy_is_probability_given_to_winner() {
        let mut ledger = OutcomeLedger::new();
        let mut tracker = PerformanceTracker::new(30);

        let id = ledger.record_prediction(draft(0.8));
        let rec = ledger.attach_side(id, Side::A).unwrap();
        assert_eq!(tracker.record_outcome_accuracy(rec), Some(0.8));

        let id = ledger.record_prediction(draft(0.8));
        let rec = ledger.attach_side(id, Side::B).unwrap();
        let acc = tracker.record_outcome_accuracy(rec).unwrap();
        assert!((acc - 0.2).abs() < 1e-12);

        let stats = tracker.get_stats();
        assert_eq!(stats.total, 2);
        assert!((stats.overall_accuracy - 0.5).abs() < 1e-12);
        assert!((stats.hit_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn unresolved_records_are_ignored() {
        let mut ledger = OutcomeLedger::new();
        let mut tracker = PerformanceTracker::new(30);
        let id = ledger.record_prediction(draft(0.6));
        let rec = ledger.get(id).unwrap();
        assert_eq!(tracker.record_outcome_accuracy(rec), None);
        assert_eq!(tracker.get_stats(), StatsView::default());
    }

    #[test]
    fn trailing_window_drops_old_values() {
        let mut ledger = OutcomeLedger::new();
        let mut tracker = PerformanceTracker::new(3);
        for (p, side) in [(0.9, Side::B), (0.9, Side::B), (0.6, Side::A), (0.7, Side::A), (0.8, Side::A)] {
            let id = ledger.record_prediction(draft(p));
            let rec = ledger.attach_side(id, side).unwrap();
            tracker.record_outcome_accuracy(rec);
        }
        let stats = tracker.get_stats();
        assert_eq!(stats.recent_samples, 3);
        assert!((stats.recent_accuracy - 0.7).abs() < 1e-12);
        assert!(stats.overall_accuracy < stats.recent_accuracy);
    }
}
