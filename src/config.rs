use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::features::Feature;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub capacity: usize,
    pub min_samples: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    // Weight of the k-th most recent game is decay^k; 1.0 is a plain mean.
    pub recency_decay: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            recency_decay: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlendConfig {
    pub logistic_scale: f64,
    pub primary_weight: f64,
    /// Per-model share of the auxiliary mass. Missing models split evenly.
    pub aux_weights: BTreeMap<String, f64>,
    pub clamp_lo: f64,
    pub clamp_hi: f64,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            logistic_scale: 1.0,
            primary_weight: 0.7,
            aux_weights: BTreeMap::new(),
            clamp_lo: 0.01,
            clamp_hi: 0.99,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearnerConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub min_resolved: usize,
    pub adaptive_rate: bool,
    pub initial_weights: Option<BTreeMap<Feature, f64>>,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.02,
            momentum: 0.8,
            min_weight: 0.03,
            max_weight: 0.65,
            min_resolved: 3,
            adaptive_rate: true,
            initial_weights: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub recent_window: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { recent_window: 30 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub scoring: ScoringConfig,
    pub blend: BlendConfig,
    pub learner: LearnerConfig,
    pub tracker: TrackerConfig,
}

impl EngineConfig {
    /// Defaults, then the optional JSON file, then `RINKCAST_*` env overrides.
    pub fn from_sources(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");

        let mut cfg = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg = serde_json::from_str::<Self>(&raw)?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let num = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());
        let int = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        if let Some(v) = int("RINKCAST_WINDOW_SIZE") {
            self.window.capacity = v.clamp(3, 200);
        }
        if let Some(v) = int("RINKCAST_MIN_SAMPLES") {
            self.window.min_samples = v.clamp(1, 50);
        }
        if let Some(v) = num("RINKCAST_RECENCY_DECAY") {
            self.scoring.recency_decay = v.clamp(0.10, 1.0);
        }
        if let Some(v) = num("RINKCAST_LOGISTIC_SCALE") {
            self.blend.logistic_scale = v.clamp(0.05, 20.0);
        }
        if let Some(v) = num("RINKCAST_PRIMARY_WEIGHT") {
            self.blend.primary_weight = v.clamp(0.0, 1.0);
        }
        if let Some(v) = num("RINKCAST_LEARNING_RATE") {
            self.learner.learning_rate = v.clamp(0.0, 1.0);
        }
        if let Some(v) = num("RINKCAST_MOMENTUM") {
            self.learner.momentum = v.clamp(0.0, 0.99);
        }
        if let Some(v) = num("RINKCAST_MIN_WEIGHT") {
            self.learner.min_weight = v.clamp(0.0, 1.0);
        }
        if let Some(v) = num("RINKCAST_MAX_WEIGHT") {
            self.learner.max_weight = v.clamp(0.0, 1.0);
        }
        if let Some(v) = int("RINKCAST_MIN_RESOLVED") {
            self.learner.min_resolved = v.min(1000);
        }
        if let Some(v) = lookup("RINKCAST_ADAPTIVE_RATE") {
            self.learner.adaptive_rate = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = int("RINKCAST_RECENT_WINDOW") {
            self.tracker.recent_window = v.clamp(1, 1000);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(EngineError::Config(msg));

        if self.window.capacity == 0 {
            return bad("window capacity must be positive".to_string());
        }
        if self.window.min_samples > self.window.capacity {
            return bad(format!(
                "min_samples {} exceeds window capacity {}",
                self.window.min_samples, self.window.capacity
            ));
        }
        if !(self.scoring.recency_decay > 0.0 && self.scoring.recency_decay <= 1.0) {
            return bad(format!("recency_decay {} not in (0, 1]", self.scoring.recency_decay));
        }

        let b = &self.blend;
        if !(b.logistic_scale.is_finite() && b.logistic_scale > 0.0) {
            return bad(format!("logistic_scale {} must be positive", b.logistic_scale));
        }
        if !(0.0..=1.0).contains(&b.primary_weight) {
            return bad(format!("primary_weight {} not in [0, 1]", b.primary_weight));
        }
        if b.aux_weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return bad("aux_weights must be finite and non-negative".to_string());
        }
        if !(0.0 < b.clamp_lo && b.clamp_lo < b.clamp_hi && b.clamp_hi < 1.0) {
            return bad(format!(
                "clamp band [{}, {}] must sit inside (0, 1)",
                b.clamp_lo, b.clamp_hi
            ));
        }

        let l = &self.learner;
        if !(l.learning_rate.is_finite() && l.learning_rate >= 0.0) {
            return bad(format!("learning_rate {} must be non-negative", l.learning_rate));
        }
        if !(0.0..1.0).contains(&l.momentum) {
            return bad(format!("momentum {} not in [0, 1)", l.momentum));
        }
        if l.min_weight < 0.0 || l.min_weight > l.max_weight {
            return bad(format!(
                "weight bounds [{}, {}] are inverted",
                l.min_weight, l.max_weight
            ));
        }
        let n = match &l.initial_weights {
            Some(w) if w.is_empty() => return bad("initial_weights is empty".to_string()),
            Some(w) => w.len(),
            None => Feature::ALL.len(),
        };
        let n = n as f64;
        if l.min_weight * n > 1.0 + 1e-9 || l.max_weight * n < 1.0 - 1e-9 {
            return bad(format!(
                "weight bounds [{}, {}] cannot sum to 1 over {n} features",
                l.min_weight, l.max_weight
            ));
        }

        if self.tracker.recent_window == 0 {
            return bad("recent_window must be positive".to_string());
        }
        Ok(())
    }
}
