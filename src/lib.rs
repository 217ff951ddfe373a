//! Online self-learning win-probability engine.
//!
//! Rolling per-entity feature windows feed a weighted differential score,
//! which is blended with auxiliary models into a clamped probability. Every
//! prediction lands in an append-only ledger; attaching its outcome drives
//! one learning step on the weights and updates accuracy tracking.

pub mod blend;
pub mod calibration;
pub mod config;
pub mod elo;
pub mod engine;
pub mod error;
pub mod feature_store;
pub mod features;
pub mod ledger;
pub mod learner;
pub mod persist;
pub mod scoring;
pub mod synthetic;
pub mod tracker;
pub mod weights;

pub use config::EngineConfig;
pub use engine::{Confidence, ConfidenceLevel, Engine, Prediction};
pub use error::{EngineError, Result};
pub use features::{Context, EntityId, Feature};
pub use ledger::RecordId;
