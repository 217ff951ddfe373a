use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::blend::AuxiliaryModel;
use crate::error::Result;
use crate::features::{Context, EntityId};
use crate::ledger::PredictionRecord;

const START_RATING: f64 = 1500.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EloConfig {
    pub k: f64,
    pub home_adv_pts: f64,
}

impl Default for EloConfig {
    fn default() -> Self {
        Self {
            k: 20.0,
            home_adv_pts: 60.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EloModel {
    cfg: EloConfig,
    ratings: BTreeMap<EntityId, f64>,
    games: BTreeMap<EntityId, u32>,
}

impl EloModel {
    pub fn new(cfg: EloConfig) -> Self {
        Self {
            cfg,
            ratings: BTreeMap::new(),
            games: BTreeMap::new(),
        }
    }

    pub fn rating(&self, entity: &EntityId) -> f64 {
        self.ratings.get(entity).copied().unwrap_or(START_RATING)
    }

    fn venue_adjusted(&self, a: &EntityId, b: &EntityId, context: Context) -> (f64, f64) {
        let (ra, rb) = (self.rating(a), self.rating(b));
        match context {
            Context::Home => (ra + self.cfg.home_adv_pts, rb),
            Context::Away => (ra, rb + self.cfg.home_adv_pts),
        }
    }
}

impl AuxiliaryModel for EloModel {
    fn name(&self) -> &str {
        "elo"
    }

    fn probability(&self, a: &EntityId, b: &EntityId, context: Context) -> Option<f64> {
        // Unrated pairs would only echo the home bonus back.
        if !self.games.contains_key(a) && !self.games.contains_key(b) {
            return None;
        }
        let (ra, rb) = self.venue_adjusted(a, b, context);
        Some(expected_score(ra, rb))
    }

    fn observe(&mut self, record: &PredictionRecord, a_won: bool) {
        let (a, b) = (&record.entity_a, &record.entity_b);
        let (ra, rb) = self.venue_adjusted(a, b, record.context);
        let expected_a = expected_score(ra, rb);
        let s_a = if a_won { 1.0 } else { 0.0 };

        let delta = self.cfg.k * (s_a - expected_a);
        let ea = self.rating(a);
        let eb = self.rating(b);
        self.ratings.insert(a.clone(), ea + delta);
        self.ratings.insert(b.clone(), eb - delta);
        *self.games.entry(a.clone()).or_insert(0) += 1;
        *self.games.entry(b.clone()).or_insert(0) += 1;
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn import_state(&mut self, state: serde_json::Value) -> Result<()> {
        if state.is_null() {
            return Ok(());
        }
        *self = serde_json::from_value(state)?;
        Ok(())
    }
}

fn expected_score(r_a: f64, r_b: f64) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf(-(r_a - r_b) / 400.0))
}
