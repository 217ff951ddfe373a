use std::collections::{BTreeMap, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(|c| c.is_control()) {
            return Err(EngineError::InvalidEntity(raw.to_string()));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Context {
    Home,
    Away,
}

impl Context {
    pub fn opposite(self) -> Self {
        match self {
            Context::Home => Context::Away,
            Context::Away => Context::Home,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Home => f.write_str("home"),
            Context::Away => f.write_str("away"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ExpectedGoalsFor,
    ExpectedGoalsAgainst,
    HighDangerFor,
    HighDangerAgainst,
    ShotAttemptShare,
    PowerPlayPct,
    PenaltyKillPct,
    GoalieGsax,
    Hits,
    Giveaways,
    Takeaways,
    RestDays,
}

impl Feature {
    pub const ALL: [Feature; 12] = [
        Feature::ExpectedGoalsFor,
        Feature::ExpectedGoalsAgainst,
        Feature::HighDangerFor,
        Feature::HighDangerAgainst,
        Feature::ShotAttemptShare,
        Feature::PowerPlayPct,
        Feature::PenaltyKillPct,
        Feature::GoalieGsax,
        Feature::Hits,
        Feature::Giveaways,
        Feature::Takeaways,
        Feature::RestDays,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Feature::ExpectedGoalsFor => "xg_for",
            Feature::ExpectedGoalsAgainst => "xg_against",
            Feature::HighDangerFor => "hd_for",
            Feature::HighDangerAgainst => "hd_against",
            Feature::ShotAttemptShare => "shot_attempt_share",
            Feature::PowerPlayPct => "pp_pct",
            Feature::PenaltyKillPct => "pk_pct",
            Feature::GoalieGsax => "gsax",
            Feature::Hits => "hits",
            Feature::Giveaways => "giveaways",
            Feature::Takeaways => "takeaways",
            Feature::RestDays => "rest_days",
        }
    }

    /// +1.0 when a larger value favours the entity, -1.0 when it hurts it.
    pub fn polarity(self) -> f64 {
        match self {
            Feature::ExpectedGoalsAgainst | Feature::HighDangerAgainst | Feature::Giveaways => {
                -1.0
            }
            _ => 1.0,
        }
    }

    /// Plausible per-game range; anything outside is a feed error.
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Feature::ShotAttemptShare | Feature::PowerPlayPct | Feature::PenaltyKillPct => {
                (0.0, 100.0)
            }
            Feature::ExpectedGoalsFor | Feature::ExpectedGoalsAgainst => (0.0, 15.0),
            Feature::HighDangerFor | Feature::HighDangerAgainst => (0.0, 60.0),
            Feature::Hits => (0.0, 150.0),
            Feature::Giveaways | Feature::Takeaways => (0.0, 80.0),
            Feature::RestDays => (0.0, 30.0),
            Feature::GoalieGsax => (-20.0, 20.0),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// Upstream scrapers are inconsistent about naming; normalise before lookup.
static ALIASES: Lazy<HashMap<&'static str, Feature>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for feature in Feature::ALL {
        m.insert(feature.key(), feature);
    }
    for (alias, feature) in [
        ("xgf", Feature::ExpectedGoalsFor),
        ("expected_goals_for", Feature::ExpectedGoalsFor),
        ("xga", Feature::ExpectedGoalsAgainst),
        ("expected_goals_against", Feature::ExpectedGoalsAgainst),
        ("hdcf", Feature::HighDangerFor),
        ("high_danger_for", Feature::HighDangerFor),
        ("hdca", Feature::HighDangerAgainst),
        ("high_danger_against", Feature::HighDangerAgainst),
        ("cf%", Feature::ShotAttemptShare),
        ("cf_pct", Feature::ShotAttemptShare),
        ("corsi_for_pct", Feature::ShotAttemptShare),
        ("pp%", Feature::PowerPlayPct),
        ("power_play_pct", Feature::PowerPlayPct),
        ("pk%", Feature::PenaltyKillPct),
        ("penalty_kill_pct", Feature::PenaltyKillPct),
        ("goalie_gsax", Feature::GoalieGsax),
        ("gsax_per_game", Feature::GoalieGsax),
        ("gv", Feature::Giveaways),
        ("tk", Feature::Takeaways),
        ("rest", Feature::RestDays),
        ("days_rest", Feature::RestDays),
    ] {
        m.insert(alias, feature);
    }
    m
});

pub fn resolve_feature(raw: &str) -> Option<Feature> {
    let key = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    ALIASES.get(key.as_str()).copied()
}

pub type FeatureVector = BTreeMap<Feature, f64>;

/// Loosely keyed observation as handed over by ingestion.
pub type RawObservation = Vec<(String, f64)>;

#[derive(Debug, Default)]
pub struct ParsedObservation {
    pub features: FeatureVector,
    pub rejected: Vec<EngineError>,
}

pub fn parse_observation(raw: &[(String, f64)]) -> ParsedObservation {
    let mut out = ParsedObservation::default();
    for (name, value) in raw {
        match check_field(name, *value) {
            Ok((feature, v)) => {
                out.features.insert(feature, v);
            }
            Err(err) => out.rejected.push(err),
        }
    }
    out
}

fn check_field(name: &str, value: f64) -> Result<(Feature, f64)> {
    let Some(feature) = resolve_feature(name) else {
        return Err(EngineError::InvalidFeature {
            field: name.to_string(),
            reason: "unknown feature name".to_string(),
        });
    };
    if !value.is_finite() {
        return Err(EngineError::InvalidFeature {
            field: name.to_string(),
            reason: format!("non-finite value {value}"),
        });
    }
    let (lo, hi) = feature.bounds();
    if value < lo || value > hi {
        return Err(EngineError::InvalidFeature {
            field: name.to_string(),
            reason: format!("{value} outside [{lo}, {hi}]"),
        });
    }
    Ok((feature, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_case_insensitively() {
        assert_eq!(resolve_feature("xGF"), Some(Feature::ExpectedGoalsFor));
        assert_eq!(resolve_feature(" CF% "), Some(Feature::ShotAttemptShare));
        assert_eq!(resolve_feature("days rest"), Some(Feature::RestDays));
        assert_eq!(resolve_feature("faceoffs"), None);
    }

    #[test]
    fn bad_fields_are_dropped_not_the_observation() {
        let raw = vec![
            ("xgf".to_string(), 2.4),
            ("pp%".to_string(), 140.0),
            ("mystery".to_string(), 1.0),
            ("hits".to_string(), f64::NAN),
            ("gsax".to_string(), -1.5),
            ("xga".to_string(), 1e308),
        ];
        let parsed = parse_observation(&raw);
        assert_eq!(parsed.features.len(), 2);
        assert_eq!(parsed.features.get(&Feature::GoalieGsax), Some(&-1.5));
        assert_eq!(parsed.rejected.len(), 4);
        assert!(
            parsed
                .rejected
                .iter()
                .all(|e| matches!(e, EngineError::InvalidFeature { .. }))
        );
    }

    #[test]
    fn entity_ids_are_normalised() {
        assert_eq!(EntityId::parse(" bos ").unwrap().as_str(), "BOS");
        assert!(EntityId::parse("   ").is_err());
    }
}
