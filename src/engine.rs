use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blend::{self, AuxiliaryModel};
use crate::calibration::CalibrationBin;
use crate::config::{EngineConfig, WindowConfig};
use crate::elo::{EloConfig, EloModel};
use crate::error::{EngineError, Result};
use crate::feature_store::{FeatureStore, FeatureWindow, WindowEntry};
use crate::features::{self, Context, EntityId, FeatureVector};
use crate::learner::{LearnOutcome, LearnerState, OnlineLearner};
use crate::ledger::{LedgerSnapshot, OutcomeLedger, PredictionDraft, PredictionRecord, RecordId};
use crate::scoring::{self, ScoreBreakdown};
use crate::tracker::{PerformanceTracker, StatsView};
use crate::weights::{MomentumState, WeightVector};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Insufficient,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    /// 0..=100, driven by window sizes only.
    pub score: u8,
    pub samples_a: usize,
    pub samples_b: usize,
}

impl Confidence {
    pub fn from_samples(samples_a: usize, samples_b: usize, window: &WindowConfig) -> Self {
        let n = samples_a.min(samples_b);
        let level = if n < window.min_samples {
            ConfidenceLevel::Insufficient
        } else if n < 8 {
            ConfidenceLevel::Low
        } else if n < 15 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        };
        let fill = n as f64 / window.capacity.max(1) as f64;
        let score = (5.0 + 90.0 * fill).clamp(5.0, 95.0).round() as u8;
        Self {
            level,
            score,
            samples_a,
            samples_b,
        }
    }

    pub fn is_sufficient(&self) -> bool {
        self.level != ConfidenceLevel::Insufficient
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub record_id: RecordId,
    pub entity_a: EntityId,
    pub entity_b: EntityId,
    pub context: Context,
    pub probability_a: f64,
    pub probability_b: f64,
    pub primary_probability: f64,
    pub raw_score: f64,
    pub confidence: Confidence,
    pub weights_version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightSnapshot {
    pub version: u64,
    pub weights: WeightVector,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub stored_fields: usize,
    pub dropped: Vec<EngineError>,
    pub evicted: bool,
}

#[derive(Debug, Clone)]
pub struct OutcomeReport {
    pub record: PredictionRecord,
    pub learning: LearnOutcome,
    pub accuracy: f64,
    pub stats: StatsView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub config: EngineConfig,
    pub learner: LearnerState,
    pub windows: Vec<WindowEntry>,
    pub ledger: LedgerSnapshot,
    #[serde(default)]
    pub auxiliary: BTreeMap<String, serde_json::Value>,
}

/// Win-probability engine.
///
/// Predictions only take read locks (plus a short append on the ledger) and
/// may run from any number of threads. Observations and outcomes go through
/// the `writer` mutex, which also owns the learner, so weight and window
/// mutations are applied strictly one at a time. Lock order is
/// writer, store, ledger, tracker, auxiliary, weights.
pub struct Engine {
    config: EngineConfig,
    writer: Mutex<OnlineLearner>,
    store: RwLock<FeatureStore>,
    ledger: Mutex<OutcomeLedger>,
    tracker: RwLock<PerformanceTracker>,
    auxiliary: RwLock<Vec<Box<dyn AuxiliaryModel>>>,
    weights: RwLock<Arc<WeightSnapshot>>,
}

impl Engine {
    /// New engine with the built-in Elo auxiliary model.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = Self::without_auxiliary(config)?;
        engine.add_auxiliary(Box::new(EloModel::new(EloConfig::default())))?;
        Ok(engine)
    }

    pub fn without_auxiliary(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let learner = OnlineLearner::new(config.learner.clone())?;
        Ok(Self::assemble(
            config.clone(),
            learner,
            FeatureStore::new(config.window.capacity),
            OutcomeLedger::new(),
        ))
    }

    fn assemble(
        config: EngineConfig,
        learner: OnlineLearner,
        store: FeatureStore,
        ledger: OutcomeLedger,
    ) -> Self {
        let mut tracker = PerformanceTracker::new(config.tracker.recent_window);
        tracker.recompute_from_ledger(&ledger);
        let weights = Arc::new(WeightSnapshot {
            version: learner.version(),
            weights: learner.weights().clone(),
        });
        Self {
            config,
            writer: Mutex::new(learner),
            store: RwLock::new(store),
            ledger: Mutex::new(ledger),
            tracker: RwLock::new(tracker),
            auxiliary: RwLock::new(Vec::new()),
            weights: RwLock::new(weights),
        }
    }

    pub fn add_auxiliary(&self, model: Box<dyn AuxiliaryModel>) -> Result<()> {
        let mut aux = write(&self.auxiliary, "auxiliary")?;
        if aux.iter().any(|m| m.name() == model.name()) {
            return Err(EngineError::Config(format!(
                "auxiliary model {} already registered",
                model.name()
            )));
        }
        aux.push(model);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store one game's features. Bad fields are dropped and reported, the rest kept.
    pub fn record_observation(
        &self,
        entity: &EntityId,
        context: Context,
        raw: &[(String, f64)],
    ) -> Result<IngestReport> {
        let parsed = features::parse_observation(raw);
        for err in &parsed.rejected {
            warn!(%entity, %context, error = %err, "dropping feature field");
        }
        let stored_fields = parsed.features.len();
        let evicted = self.record_features(entity, context, parsed.features)?;
        Ok(IngestReport {
            stored_fields,
            dropped: parsed.rejected,
            evicted,
        })
    }

    pub fn record_features(
        &self,
        entity: &EntityId,
        context: Context,
        features: FeatureVector,
    ) -> Result<bool> {
        let _writer = lock(&self.writer, "writer")?;
        let mut store = write(&self.store, "feature store")?;
        let evicted = store.record_observation(entity, context, features);
        debug!(
            %entity,
            %context,
            samples = store.sample_count(entity, context),
            evicted,
            "observation recorded"
        );
        Ok(evicted)
    }

    pub fn get_window(&self, entity: &EntityId, context: Context) -> Result<FeatureWindow> {
        Ok(read(&self.store, "feature store")?.get_window(entity, context))
    }

    /// `context` is entity A's venue; B is read from the opposite context.
    /// Cold-start pairs get a neutral primary model and an `Insufficient` flag.
    pub fn predict(&self, a: &EntityId, b: &EntityId, context: Context) -> Result<Prediction> {
        self.predict_inner(a, b, context, false)
    }

    /// Same as `predict` but cold start is an `InsufficientData` error.
    pub fn predict_strict(&self, a: &EntityId, b: &EntityId, context: Context) -> Result<Prediction> {
        self.predict_inner(a, b, context, true)
    }

    pub fn predict_many(&self, requests: &[(EntityId, EntityId, Context)]) -> Vec<Result<Prediction>> {
        requests
            .par_iter()
            .map(|(a, b, context)| self.predict(a, b, *context))
            .collect()
    }

    fn predict_inner(
        &self,
        a: &EntityId,
        b: &EntityId,
        context: Context,
        strict: bool,
    ) -> Result<Prediction> {
        if a == b {
            return Err(EngineError::InvalidEntity(format!("{a} cannot play itself")));
        }
        let decay = self.config.scoring.recency_decay;
        let min_samples = self.config.window.min_samples;

        let (summary_a, summary_b) = {
            let store = read(&self.store, "feature store")?;
            if strict {
                (
                    store.summarize(a, context, min_samples, decay)?,
                    store.summarize(b, context.opposite(), min_samples, decay)?,
                )
            } else {
                (
                    store.summarize_lenient(a, context, decay),
                    store.summarize_lenient(b, context.opposite(), decay),
                )
            }
        };
        let confidence = Confidence::from_samples(summary_a.samples, summary_b.samples, &self.config.window);

        let weights = self.current_weights()?;
        let breakdown = if confidence.is_sufficient() {
            scoring::score_summaries(&summary_a, &summary_b, &weights.weights)
        } else {
            ScoreBreakdown::default()
        };

        let aux_probs = {
            let aux = read(&self.auxiliary, "auxiliary")?;
            aux.iter()
                .filter_map(|m| m.probability(a, b, context).map(|p| (m.name().to_string(), p)))
                .collect::<Vec<_>>()
        };
        let aux_refs = aux_probs
            .iter()
            .map(|(name, p)| (name.as_str(), *p))
            .collect::<Vec<_>>();
        let blended = blend::blend(breakdown.raw, &aux_refs, &self.config.blend);

        let draft = PredictionDraft {
            entity_a: a.clone(),
            entity_b: b.clone(),
            context,
            summary_a,
            summary_b,
            differentials: breakdown.differentials,
            raw_score: breakdown.raw,
            primary_probability: blended.primary,
            probability_a: blended.probability,
            weights_version: weights.version,
        };
        let record_id = lock(&self.ledger, "ledger")?.record_prediction(draft);

        debug!(
            record = %record_id,
            %a,
            %b,
            %context,
            raw = breakdown.raw,
            p_a = blended.probability,
            confidence = ?confidence.level,
            "prediction issued"
        );

        Ok(Prediction {
            record_id,
            entity_a: a.clone(),
            entity_b: b.clone(),
            context,
            probability_a: blended.probability,
            probability_b: 1.0 - blended.probability,
            primary_probability: blended.primary,
            raw_score: breakdown.raw,
            confidence,
            weights_version: weights.version,
        })
    }

    /// The only learning trigger. Fails without side effects on a second call.
    pub fn attach_outcome(&self, record_id: RecordId, winner: &EntityId) -> Result<OutcomeReport> {
        let mut learner = lock(&self.writer, "writer")?;
        // Every guard is held before the ledger changes so a poisoned lock
        // can't leave a resolved record that was never scored or learned from.
        let mut ledger = lock(&self.ledger, "ledger")?;
        let mut tracker = write(&self.tracker, "tracker")?;
        let mut auxiliary = write(&self.auxiliary, "auxiliary")?;
        let mut weights = write(&self.weights, "weights")?;

        let record = match ledger.attach_outcome(record_id, winner) {
            Ok(rec) => rec.clone(),
            Err(err) => {
                warn!(record = %record_id, %winner, error = %err, "outcome rejected");
                return Err(err);
            }
        };
        let resolved_in_context = ledger.resolved_count(record.context);
        drop(ledger);
        let a_won = record.a_won().unwrap_or(false);

        let learning = learner.update(&record, resolved_in_context, tracker.recent_accuracy());
        if learning.is_applied() {
            *weights = Arc::new(WeightSnapshot {
                version: learner.version(),
                weights: learner.weights().clone(),
            });
        }
        drop(weights);

        let accuracy = tracker.record_outcome_accuracy(&record).unwrap_or(0.0);
        let stats = tracker.get_stats();
        drop(tracker);

        for model in auxiliary.iter_mut() {
            model.observe(&record, a_won);
        }
        drop(auxiliary);

        info!(
            record = %record_id,
            %winner,
            accuracy,
            applied = learning.is_applied(),
            "outcome attached"
        );

        Ok(OutcomeReport {
            record,
            learning,
            accuracy,
            stats,
        })
    }

    /// Possibly a version behind an in-flight learning step.
    pub fn current_weights(&self) -> Result<Arc<WeightSnapshot>> {
        Ok(read(&self.weights, "weights")?.clone())
    }

    pub fn momentum(&self) -> Result<MomentumState> {
        Ok(lock(&self.writer, "writer")?.momentum().clone())
    }

    pub fn stats(&self) -> Result<StatsView> {
        Ok(read(&self.tracker, "tracker")?.get_stats())
    }

    /// Full rebuild of tracker state from the ledger.
    pub fn recompute_stats(&self) -> Result<StatsView> {
        let _writer = lock(&self.writer, "writer")?;
        let ledger = lock(&self.ledger, "ledger")?;
        let mut tracker = write(&self.tracker, "tracker")?;
        tracker.recompute_from_ledger(&ledger);
        Ok(tracker.get_stats())
    }

    pub fn calibration_bins(&self, bins: usize) -> Result<Vec<CalibrationBin>> {
        let ledger = lock(&self.ledger, "ledger")?;
        Ok(PerformanceTracker::calibration_bins(&ledger, bins))
    }

    pub fn record(&self, id: RecordId) -> Result<Option<PredictionRecord>> {
        Ok(lock(&self.ledger, "ledger")?.get(id).cloned())
    }

    pub fn ledger_len(&self) -> Result<usize> {
        Ok(lock(&self.ledger, "ledger")?.len())
    }

    /// Consistent cut of all long-lived state.
    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        let learner = lock(&self.writer, "writer")?;
        let windows = read(&self.store, "feature store")?.to_entries();
        let ledger = lock(&self.ledger, "ledger")?.snapshot();
        let auxiliary = read(&self.auxiliary, "auxiliary")?
            .iter()
            .map(|m| (m.name().to_string(), m.export_state()))
            .collect();
        Ok(EngineSnapshot {
            format_version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            config: self.config.clone(),
            learner: learner.state().clone(),
            windows,
            ledger,
            auxiliary,
        })
    }

    /// Rebuild from a snapshot using the snapshot's own config.
    pub fn restore(snapshot: EngineSnapshot) -> Result<Self> {
        let config = snapshot.config.clone();
        Self::restore_with(config, snapshot)
    }

    pub fn restore_with(config: EngineConfig, snapshot: EngineSnapshot) -> Result<Self> {
        Self::restore_with_models(config, snapshot, Vec::new())
    }

    /// Restore and re-register auxiliary models. Each saved model state is
    /// imported into the supplied model of the same name; a saved `elo` with
    /// no supplied match gets the built-in model. Saved state that no model
    /// claims is an error rather than a silently dropped blend input.
    pub fn restore_with_models(
        config: EngineConfig,
        snapshot: EngineSnapshot,
        models: Vec<Box<dyn AuxiliaryModel>>,
    ) -> Result<Self> {
        if snapshot.format_version != SNAPSHOT_VERSION {
            return Err(EngineError::Persistence(format!(
                "unsupported snapshot version {}",
                snapshot.format_version
            )));
        }
        config.validate()?;
        let learner = OnlineLearner::from_state(config.learner.clone(), snapshot.learner)?;
        let store = FeatureStore::from_entries(config.window.capacity, snapshot.windows)?;
        let ledger = OutcomeLedger::restore(snapshot.ledger)?;

        let mut models = models;
        let mut saved = snapshot.auxiliary;
        for model in models.iter_mut() {
            if let Some(state) = saved.remove(model.name()) {
                model.import_state(state)?;
            }
        }
        if let Some(state) = saved.remove("elo") {
            let mut elo = EloModel::new(EloConfig::default());
            elo.import_state(state)?;
            models.push(Box::new(elo));
        }
        if !saved.is_empty() {
            let names = saved.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(EngineError::Persistence(format!(
                "no auxiliary model registered for saved state: {names}"
            )));
        }

        let engine = Self::assemble(config, learner, store, ledger);
        for model in models {
            engine.add_auxiliary(model)?;
        }

        info!(
            records = engine.ledger_len()?,
            version = engine.current_weights()?.version,
            "engine restored"
        );
        Ok(engine)
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    m.lock().map_err(|_| EngineError::poisoned(what))
}

fn read<'a, T>(l: &'a RwLock<T>, what: &str) -> Result<RwLockReadGuard<'a, T>> {
    l.read().map_err(|_| EngineError::poisoned(what))
}

fn write<'a, T>(l: &'a RwLock<T>, what: &str) -> Result<RwLockWriteGuard<'a, T>> {
    l.write().map_err(|_| EngineError::poisoned(what))
}
