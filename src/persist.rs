use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineSnapshot};
use crate::error::{EngineError, Result};
use crate::learner::LearnerState;
use crate::ledger::{LedgerSnapshot, PredictionRecord};

const APP_DIR: &str = "rinkcast";

/// Opaque load/save of the full engine state.
pub trait StateStore {
    fn load(&self) -> Result<Option<EngineSnapshot>>;
    fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// Restore from `store`, or start fresh when nothing has been saved yet.
pub fn load_or_new(store: &dyn StateStore, config: EngineConfig) -> Result<Engine> {
    match store.load()? {
        Some(snapshot) => Engine::restore_with(config, snapshot),
        None => Engine::new(config),
    }
}

pub fn save_engine(store: &dyn StateStore, engine: &Engine) -> Result<()> {
    store.save(&engine.snapshot()?)
}

pub fn app_data_dir() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_DATA_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".local").join("share").join(APP_DIR))
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Option<Self> {
        app_data_dir().map(|dir| Self::new(dir.join("engine.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str::<EngineSnapshot>(&raw)?))
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        let conn = store.connect()?;
        init_schema(&conn)?;
        Ok(store)
    }

    pub fn default_location() -> Option<PathBuf> {
        app_data_dir().map(|dir| dir.join("engine.sqlite"))
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).ok();
        }
        Ok(Connection::open(&self.path)?)
    }
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS model_state (
            key TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS predictions (
            record_id INTEGER PRIMARY KEY,
            entity_a TEXT NOT NULL,
            entity_b TEXT NOT NULL,
            context TEXT NOT NULL,
            probability_a REAL NOT NULL,
            winner TEXT NULL,
            resolved_seq INTEGER NULL,
            body TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_predictions_resolved ON predictions(resolved_seq);
        "#,
    )?;
    Ok(())
}

impl StateStore for SqliteStore {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        let conn = self.connect()?;
        init_schema(&conn)?;

        let get = |key: &str| -> Result<Option<String>> {
            Ok(conn
                .query_row(
                    "SELECT body FROM model_state WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        };
        let Some(meta) = get("meta")? else {
            return Ok(None);
        };
        let meta: SnapshotMeta = serde_json::from_str(&meta)?;
        let learner: LearnerState = serde_json::from_str(&require(get("learner")?, "learner")?)?;
        let windows = serde_json::from_str(&require(get("windows")?, "windows")?)?;
        let auxiliary = match get("auxiliary")? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Default::default(),
        };

        let mut stmt = conn.prepare("SELECT body FROM predictions ORDER BY record_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str::<PredictionRecord>(&row?)?);
        }

        Ok(Some(EngineSnapshot {
            format_version: meta.format_version,
            saved_at: meta.saved_at,
            config: meta.config,
            learner,
            windows,
            ledger: LedgerSnapshot {
                next_id: meta.next_record_id,
                records,
            },
            auxiliary,
        }))
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let mut conn = self.connect()?;
        init_schema(&conn)?;
        let now = Utc::now().to_rfc3339();

        let meta = SnapshotMeta {
            format_version: snapshot.format_version,
            saved_at: snapshot.saved_at,
            config: snapshot.config.clone(),
            next_record_id: snapshot.ledger.next_id,
        };

        let tx = conn.transaction()?;
        for (key, body) in [
            ("meta", serde_json::to_string(&meta)?),
            ("learner", serde_json::to_string(&snapshot.learner)?),
            ("windows", serde_json::to_string(&snapshot.windows)?),
            ("auxiliary", serde_json::to_string(&snapshot.auxiliary)?),
        ] {
            tx.execute(
                "INSERT INTO model_state (key, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![key, body, now],
            )?;
        }

        // Records only ever gain an outcome, so an upsert per row is enough.
        for record in &snapshot.ledger.records {
            let winner = record.winner().map(|w| format!("{w:?}"));
            let seq = record.resolution.as_ref().map(|r| r.sequence as i64);
            tx.execute(
                r#"
                INSERT INTO predictions (
                    record_id, entity_a, entity_b, context, probability_a, winner, resolved_seq, body
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(record_id) DO UPDATE SET
                    winner = excluded.winner,
                    resolved_seq = excluded.resolved_seq,
                    body = excluded.body
                "#,
                params![
                    record.id.0 as i64,
                    record.entity_a.as_str(),
                    record.entity_b.as_str(),
                    record.context.to_string(),
                    record.probability_a,
                    winner,
                    seq,
                    serde_json::to_string(record)?,
                ],
            )?;
        }
        tx.execute(
            "DELETE FROM predictions WHERE record_id > ?1",
            params![snapshot.ledger.next_id as i64],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotMeta {
    format_version: u32,
    saved_at: chrono::DateTime<Utc>,
    config: EngineConfig,
    next_record_id: u64,
}

fn require(value: Option<String>, key: &str) -> Result<String> {
    value.ok_or_else(|| EngineError::Persistence(format!("model_state row {key} missing")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Context, EntityId};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("rinkcast-{name}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn missing_json_file_means_fresh_start() {
        let store = JsonFileStore::new(temp_path("absent").join("engine.json"));
        assert!(store.load().unwrap().is_none());
        let engine = load_or_new(&store, EngineConfig::default()).unwrap();
        assert_eq!(engine.ledger_len().unwrap(), 0);
    }

    #[test]
    fn sqlite_round_trip_keeps_pending_and_resolved_records() {
        let path = temp_path("sqlite").join("engine.sqlite");
        let store = SqliteStore::open(&path).unwrap();
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let bos = EntityId::parse("BOS").unwrap();
        let tor = EntityId::parse("TOR").unwrap();
        let first = engine.predict(&bos, &tor, Context::Home).unwrap();
        let _second = engine.predict(&tor, &bos, Context::Home).unwrap();
        engine.attach_outcome(first.record_id, &tor).unwrap();

        save_engine(&store, &engine).unwrap();
        let restored = load_or_new(&store, EngineConfig::default()).unwrap();
        assert_eq!(restored.ledger_len().unwrap(), 2);
        let rec = restored.record(first.record_id).unwrap().unwrap();
        assert!(rec.is_resolved());
        assert!(matches!(
            restored.attach_outcome(first.record_id, &bos),
            Err(EngineError::AlreadyResolved(_))
        ));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
