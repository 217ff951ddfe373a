use crate::config::BlendConfig;
use crate::features::{Context, EntityId};
use crate::ledger::PredictionRecord;

/// A secondary win-probability source mixed in with fixed weights.
pub trait AuxiliaryModel: Send + Sync {
    fn name(&self) -> &str;

    /// Probability that `a` (playing in `context`) beats `b`. `None` abstains.
    fn probability(&self, a: &EntityId, b: &EntityId, context: Context) -> Option<f64>;

    fn observe(&mut self, record: &PredictionRecord, a_won: bool);

    fn export_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn import_state(&mut self, _state: serde_json::Value) -> crate::error::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blended {
    pub primary: f64,
    pub probability: f64,
    pub aux_used: usize,
}

/// Logistic squash: 1 / (1 + exp(-scale * raw)).
pub fn sigmoid(raw: f64, scale: f64) -> f64 {
    let z = scale * raw;
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

pub fn blend(raw_score: f64, auxiliary: &[(&str, f64)], cfg: &BlendConfig) -> Blended {
    let primary = sigmoid(raw_score, cfg.logistic_scale);
    let primary = if primary.is_finite() { primary } else { 0.5 };

    let aux = auxiliary
        .iter()
        .filter(|(_, p)| p.is_finite())
        .map(|(name, p)| {
            let share = cfg.aux_weights.get(*name).copied().unwrap_or(1.0);
            (share, p.clamp(0.0, 1.0))
        })
        .filter(|(share, _)| *share > 0.0)
        .collect::<Vec<_>>();
    let share_sum: f64 = aux.iter().map(|(s, _)| s).sum();

    let mixed = if aux.is_empty() || share_sum <= 0.0 {
        primary
    } else {
        let aux_mass = 1.0 - cfg.primary_weight;
        let aux_p: f64 = aux.iter().map(|(s, p)| s / share_sum * p).sum();
        cfg.primary_weight * primary + aux_mass * aux_p
    };

    Blended {
        primary,
        probability: mixed.clamp(cfg.clamp_lo, cfg.clamp_hi),
        aux_used: aux.len(),
    }
}
