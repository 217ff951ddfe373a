use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rinkcast::calibration;
use rinkcast::engine::Engine;
use rinkcast::persist::{self, JsonFileStore, SqliteStore, StateStore};
use rinkcast::synthetic::{GameRecord, SyntheticLeague};
use rinkcast::{Context, EngineConfig, EntityId};

const DEFAULT_SEED: u64 = 42;
const DEFAULT_TEAMS: usize = 16;
const DEFAULT_GAMES: usize = 1230;
const DEFAULT_BINS: usize = 10;

fn main() -> Result<()> {
    init_logging();

    let config_path = parse_path_arg("--config");
    let config = EngineConfig::from_sources(config_path.as_deref()).context("config")?;

    let store = open_store()?;
    let engine = match (&store, has_flag("--resume")) {
        (Some(store), true) => persist::load_or_new(&**store, config)?,
        _ => Engine::new(config)?,
    };

    let games = match parse_path_arg("--games") {
        Some(path) => read_games(&path)?,
        None => synthetic_games(),
    };
    if games.is_empty() {
        return Err(anyhow!("no games to replay"));
    }

    let mut preds = Vec::with_capacity(games.len());
    let mut outcomes = Vec::with_capacity(games.len());
    let mut confident_preds = Vec::new();
    let mut confident_outcomes = Vec::new();
    let mut skipped = 0usize;

    for (idx, game) in games.iter().enumerate() {
        match replay_game(&engine, game) {
            Ok(Some((p_home, home_won, sufficient))) => {
                preds.push(p_home);
                outcomes.push(home_won);
                if sufficient {
                    confident_preds.push(p_home);
                    confident_outcomes.push(home_won);
                }
            }
            Ok(None) => skipped += 1,
            Err(err) => {
                warn!(game = idx + 1, error = %err, "skipping game");
                skipped += 1;
            }
        }
    }

    let stats = engine.stats()?;
    let weights = engine.current_weights()?;
    let all = calibration::evaluate(&preds, &outcomes);
    let confident = calibration::evaluate(&confident_preds, &confident_outcomes);
    let bins = engine.calibration_bins(parse_usize_arg("--bins").unwrap_or(DEFAULT_BINS))?;

    println!("Walk-forward replay");
    println!("Games: {} (skipped {skipped})", games.len());
    println!(
        "Tracker: total={} overall={:.4} recent={:.4} ({} samples) hit_rate={:.4}",
        stats.total, stats.overall_accuracy, stats.recent_accuracy, stats.recent_samples, stats.hit_rate
    );
    println!(
        "All predictions:       n={:>5} brier={:.4} logloss={:.4} acc={:.4}",
        all.samples, all.brier, all.log_loss, all.accuracy
    );
    println!(
        "Sufficient confidence: n={:>5} brier={:.4} logloss={:.4} acc={:.4}",
        confident.samples, confident.brier, confident.log_loss, confident.accuracy
    );
    println!();
    println!("Weights (version {}):", weights.version);
    for (feature, w) in weights.weights.iter() {
        println!("  {:<14} {:.4}", feature.key(), w);
    }
    println!();
    println!("Calibration (ece={:.4}):", calibration::expected_calibration_error(&bins));
    for bin in bins.iter().filter(|b| b.count > 0) {
        println!(
            "  [{:.2}, {:.2})  n={:>5}  pred={:.3}  actual={:.3}",
            bin.bucket_start, bin.bucket_end, bin.count, bin.avg_pred, bin.actual_rate
        );
    }

    if let Some(store) = store {
        persist::save_engine(&*store, &engine)?;
        info!("state saved");
    }
    Ok(())
}

/// Predict, resolve, then feed the game's own features forward.
fn replay_game(engine: &Engine, game: &GameRecord) -> Result<Option<(f64, bool, bool)>> {
    let home = EntityId::parse(&game.home)?;
    let away = EntityId::parse(&game.away)?;
    let winner = EntityId::parse(&game.winner)?;
    if winner != home && winner != away {
        warn!(%home, %away, %winner, "winner is neither side");
        return Ok(None);
    }

    let prediction = engine.predict(&home, &away, Context::Home)?;
    engine.attach_outcome(prediction.record_id, &winner)?;
    engine.record_observation(&home, Context::Home, &game.home_observation())?;
    engine.record_observation(&away, Context::Away, &game.away_observation())?;

    Ok(Some((
        prediction.probability_a,
        winner == home,
        prediction.confidence.is_sufficient(),
    )))
}

fn read_games(path: &Path) -> Result<Vec<GameRecord>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let game: GameRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("{}:{}", path.display(), idx + 1))?;
        out.push(game);
    }
    Ok(out)
}

fn synthetic_games() -> Vec<GameRecord> {
    let seed = parse_u64_arg("--seed").unwrap_or(DEFAULT_SEED);
    let teams = parse_usize_arg("--teams").unwrap_or(DEFAULT_TEAMS).clamp(2, 64);
    let games = parse_usize_arg("--season-games").unwrap_or(DEFAULT_GAMES);
    let seasons = parse_usize_arg("--seasons").unwrap_or(1).clamp(1, 20);
    let drift = parse_f64_arg("--drift").unwrap_or(0.25).clamp(0.0, 2.0);

    let mut league = SyntheticLeague::new(teams, seed);
    let mut out = Vec::with_capacity(games * seasons);
    for season in 0..seasons {
        if season > 0 {
            league.drift(drift);
        }
        out.extend(league.season(games));
    }
    info!(seed, teams, games = out.len(), "synthetic schedule generated");
    out
}

fn open_store() -> Result<Option<Box<dyn StateStore>>> {
    if let Some(path) = parse_path_arg("--json") {
        return Ok(Some(Box::new(JsonFileStore::new(path))));
    }
    if has_flag("--db") || parse_path_arg("--db").is_some() {
        let path = parse_path_arg("--db")
            .or_else(|| std::env::var("RINKCAST_DB_PATH").ok().map(PathBuf::from))
            .or_else(SqliteStore::default_location)
            .context("unable to resolve sqlite path")?;
        return Ok(Some(Box::new(SqliteStore::open(path)?)));
    }
    Ok(None)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rinkcast=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix(&format!("{name}=")) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == name {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() && !next.starts_with("--") {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}

fn parse_f64_arg(name: &str) -> Option<f64> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && let Ok(v) = raw.trim().parse::<f64>()
        {
            return Some(v);
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && let Ok(v) = next.trim().parse::<f64>()
        {
            return Some(v);
        }
    }
    None
}

fn parse_usize_arg(name: &str) -> Option<usize> {
    parse_f64_arg(name).filter(|v| *v >= 0.0).map(|v| v as usize)
}

fn parse_u64_arg(name: &str) -> Option<u64> {
    parse_f64_arg(name).filter(|v| *v >= 0.0).map(|v| v as u64)
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
