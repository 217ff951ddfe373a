use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::feature_store::WindowSummary;
use crate::features::{Context, EntityId, FeatureVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub winner: Side,
    pub resolved_at: DateTime<Utc>,
    /// Position in the order outcomes became known.
    pub sequence: u64,
}

/// Everything the prediction path knows; the ledger assigns id and time.
#[derive(Debug, Clone)]
pub struct PredictionDraft {
    pub entity_a: EntityId,
    pub entity_b: EntityId,
    pub context: Context,
    pub summary_a: WindowSummary,
    pub summary_b: WindowSummary,
    pub differentials: FeatureVector,
    pub raw_score: f64,
    pub primary_probability: f64,
    pub probability_a: f64,
    pub weights_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: RecordId,
    pub entity_a: EntityId,
    pub entity_b: EntityId,
    /// Venue of entity A.
    pub context: Context,
    pub created_at: DateTime<Utc>,
    pub summary_a: WindowSummary,
    pub summary_b: WindowSummary,
    pub differentials: FeatureVector,
    pub raw_score: f64,
    pub primary_probability: f64,
    pub probability_a: f64,
    pub probability_b: f64,
    pub weights_version: u64,
    pub resolution: Option<Resolution>,
}

impl PredictionRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn winner(&self) -> Option<Side> {
        self.resolution.as_ref().map(|r| r.winner)
    }

    pub fn a_won(&self) -> Option<bool> {
        self.winner().map(|w| w == Side::A)
    }

    pub fn probability_for(&self, side: Side) -> f64 {
        match side {
            Side::A => self.probability_a,
            Side::B => self.probability_b,
        }
    }

    /// Probability the blended model gave to whoever actually won.
    pub fn probability_of_winner(&self) -> Option<f64> {
        self.winner().map(|w| self.probability_for(w))
    }

    pub fn side_of(&self, entity: &EntityId) -> Option<Side> {
        if *entity == self.entity_a {
            Some(Side::A)
        } else if *entity == self.entity_b {
            Some(Side::B)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub next_id: u64,
    pub records: Vec<PredictionRecord>,
}

/// Append-only prediction log. Each record may be resolved exactly once.
#[derive(Debug, Clone, Default)]
pub struct OutcomeLedger {
    records: Vec<PredictionRecord>,
    index: HashMap<RecordId, usize>,
    resolution_order: Vec<usize>,
    resolved_by_context: HashMap<Context, usize>,
    next_id: u64,
}

impl OutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_prediction(&mut self, draft: PredictionDraft) -> RecordId {
        self.next_id += 1;
        let id = RecordId(self.next_id);
        let record = PredictionRecord {
            id,
            entity_a: draft.entity_a,
            entity_b: draft.entity_b,
            context: draft.context,
            created_at: Utc::now(),
            summary_a: draft.summary_a,
            summary_b: draft.summary_b,
            differentials: draft.differentials,
            raw_score: draft.raw_score,
            primary_probability: draft.primary_probability,
            probability_a: draft.probability_a,
            probability_b: 1.0 - draft.probability_a,
            weights_version: draft.weights_version,
            resolution: None,
        };
        self.index.insert(id, self.records.len());
        self.records.push(record);
        id
    }

    pub fn attach_outcome(&mut self, id: RecordId, winner: &EntityId) -> Result<&PredictionRecord> {
        let record = self.get(id).ok_or(EngineError::NotFound(id))?;
        if record.is_resolved() {
            return Err(EngineError::AlreadyResolved(id));
        }
        let side = record.side_of(winner).ok_or_else(|| EngineError::UnknownWinner {
            record: id,
            winner: winner.clone(),
        })?;
        self.attach_side(id, side)
    }

    pub fn attach_side(&mut self, id: RecordId, winner: Side) -> Result<&PredictionRecord> {
        let idx = *self.index.get(&id).ok_or(EngineError::NotFound(id))?;
        let sequence = self.resolution_order.len() as u64 + 1;
        let record = &mut self.records[idx];
        if record.is_resolved() {
            return Err(EngineError::AlreadyResolved(id));
        }
        record.resolution = Some(Resolution {
            winner,
            resolved_at: Utc::now(),
            sequence,
        });
        let context = record.context;
        self.resolution_order.push(idx);
        *self.resolved_by_context.entry(context).or_insert(0) += 1;
        Ok(&self.records[idx])
    }

    pub fn get(&self, id: RecordId) -> Option<&PredictionRecord> {
        self.index.get(&id).map(|idx| &self.records[*idx])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    pub fn resolved_len(&self) -> usize {
        self.resolution_order.len()
    }

    pub fn resolved_count(&self, context: Context) -> usize {
        self.resolved_by_context.get(&context).copied().unwrap_or(0)
    }

    pub fn resolved_in_order(&self) -> impl Iterator<Item = &PredictionRecord> + '_ {
        self.resolution_order.iter().map(|idx| &self.records[*idx])
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            next_id: self.next_id,
            records: self.records.clone(),
        }
    }

    pub fn restore(snapshot: LedgerSnapshot) -> Result<Self> {
        let mut ledger = Self {
            next_id: snapshot.next_id,
            ..Self::default()
        };
        let mut sequenced = Vec::new();
        for record in snapshot.records {
            if record.id.0 == 0 || record.id.0 > snapshot.next_id {
                return Err(corrupt(format!("record id {} out of range", record.id)));
            }
            if ledger.index.contains_key(&record.id) {
                return Err(corrupt(format!("duplicate record id {}", record.id)));
            }
            let idx = ledger.records.len();
            if let Some(res) = &record.resolution {
                sequenced.push((res.sequence, idx));
                *ledger.resolved_by_context.entry(record.context).or_insert(0) += 1;
            }
            ledger.index.insert(record.id, idx);
            ledger.records.push(record);
        }

        sequenced.sort_unstable();
        for (pos, (sequence, _)) in sequenced.iter().enumerate() {
            if *sequence != pos as u64 + 1 {
                return Err(corrupt(format!("resolution sequence broken at {sequence}")));
            }
        }
        ledger.resolution_order = sequenced.into_iter().map(|(_, idx)| idx).collect();
        Ok(ledger)
    }
}

fn corrupt(msg: String) -> EngineError {
    EngineError::Persistence(format!("ledger: {msg}"))
}
