use thiserror::Error;

use crate::features::{Context, EntityId};
use crate::ledger::RecordId;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("insufficient data for {entity} ({context}): {have} of {need} observations")]
    InsufficientData {
        entity: EntityId,
        context: Context,
        have: usize,
        need: usize,
    },

    #[error("prediction {0} already has an outcome")]
    AlreadyResolved(RecordId),

    #[error("prediction {0} not found")]
    NotFound(RecordId),

    #[error("invalid feature {field}: {reason}")]
    InvalidFeature { field: String, reason: String },

    #[error("winner {winner} is not a side of prediction {record}")]
    UnknownWinner { record: RecordId, winner: EntityId },

    #[error("invalid entity id: {0:?}")]
    InvalidEntity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, EngineError::InsufficientData { .. })
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        EngineError::Persistence(format!("{what} lock poisoned"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
