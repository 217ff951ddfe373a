use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::blend::sigmoid;

const HOME_EDGE: f64 = 0.15;

/// One finished game as the replay tool and tests consume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub home: String,
    pub away: String,
    #[serde(default)]
    pub home_features: BTreeMap<String, f64>,
    #[serde(default)]
    pub away_features: BTreeMap<String, f64>,
    pub winner: String,
}

impl GameRecord {
    pub fn home_observation(&self) -> Vec<(String, f64)> {
        self.home_features
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn away_observation(&self) -> Vec<(String, f64)> {
        self.away_features
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticTeam {
    pub name: String,
    pub strength: f64,
}

/// Seeded league whose teams have a hidden strength driving both box-score
/// style features and results.
pub struct SyntheticLeague {
    teams: Vec<SyntheticTeam>,
    rng: StdRng,
}

impl SyntheticLeague {
    pub fn new(n_teams: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let teams = (0..n_teams.max(2))
            .map(|i| SyntheticTeam {
                name: format!("T{:02}", i + 1),
                strength: rng.gen_range(-1.0..1.0),
            })
            .collect();
        Self { teams, rng }
    }

    pub fn teams(&self) -> &[SyntheticTeam] {
        &self.teams
    }

    /// Shift every team's strength by a random step, e.g. across a trade deadline.
    pub fn drift(&mut self, amount: f64) {
        for team in &mut self.teams {
            team.strength += self.rng.gen_range(-amount..=amount);
        }
    }

    pub fn next_game(&mut self) -> GameRecord {
        let n = self.teams.len();
        let h = self.rng.gen_range(0..n);
        let mut a = self.rng.gen_range(0..n - 1);
        if a >= h {
            a += 1;
        }
        let home = self.teams[h].clone();
        let away = self.teams[a].clone();
        let edge = home.strength - away.strength + HOME_EDGE;

        let home_features = self.box_score(edge);
        let away_features = self.box_score(-edge);
        let home_won = self.rng.gen_bool(sigmoid(edge, 1.2));

        GameRecord {
            winner: if home_won { home.name.clone() } else { away.name.clone() },
            home: home.name,
            away: away.name,
            home_features,
            away_features,
        }
    }

    pub fn season(&mut self, games: usize) -> Vec<GameRecord> {
        (0..games).map(|_| self.next_game()).collect()
    }

    fn box_score(&mut self, edge: f64) -> BTreeMap<String, f64> {
        let mut noise = |scale: f64| self.rng.gen_range(-scale..=scale);
        let xgf = (2.8 + 0.6 * edge + noise(0.5)).max(0.1);
        let xga = (2.8 - 0.6 * edge + noise(0.5)).max(0.1);
        let hdf = (11.0 + 3.0 * edge + noise(2.0)).max(0.0);
        let hda = (11.0 - 3.0 * edge + noise(2.0)).max(0.0);
        let cf = (50.0 + 6.0 * edge + noise(4.0)).clamp(25.0, 75.0);
        let pp = (20.0 + 4.0 * edge + noise(8.0)).clamp(0.0, 100.0);
        let pk = (80.0 + 4.0 * edge + noise(8.0)).clamp(0.0, 100.0);
        let gsax = 0.4 * edge + noise(1.0);
        let hits = (22.0 + noise(6.0)).max(0.0);
        let giveaways = (9.0 - edge + noise(3.0)).max(0.0);
        let takeaways = (7.0 + edge + noise(3.0)).max(0.0);
        let rest = noise(1.0).abs().round() + 1.0;

        BTreeMap::from([
            ("xgf".to_string(), xgf),
            ("xga".to_string(), xga),
            ("hdcf".to_string(), hdf),
            ("hdca".to_string(), hda),
            ("cf%".to_string(), cf),
            ("pp%".to_string(), pp),
            ("pk%".to_string(), pk),
            ("gsax".to_string(), gsax),
            ("hits".to_string(), hits),
            ("giveaways".to_string(), giveaways),
            ("takeaways".to_string(), takeaways),
            ("rest_days".to_string(), rest),
        ])
    }
}
