use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use rinkcast::engine::Engine;
use rinkcast::synthetic::SyntheticLeague;
use rinkcast::{Context, EngineConfig, EntityId};

fn id(s: &str) -> EntityId {
    EntityId::parse(s).unwrap()
}

#[test]
fn readers_always_see_a_complete_weight_vector() {
    let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
    let done = Arc::new(AtomicBool::new(false));
    let games = SyntheticLeague::new(8, 5).season(400);

    let readers = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let a = id(&format!("T{:02}", t + 1));
                let b = id(&format!("T{:02}", t + 5));
                let mut last_version = 0;
                let mut seen = 0usize;
                while !done.load(Ordering::Acquire) || seen == 0 {
                    let snap = engine.current_weights().unwrap();
                    assert!(snap.weights.within_bounds(0.03, 0.65));
                    assert!(snap.version >= last_version);
                    last_version = snap.version;

                    let pred = engine.predict(&a, &b, Context::Home).unwrap();
                    assert!((0.01..=0.99).contains(&pred.probability_a));
                    seen += 1;
                }
                seen
            })
        })
        .collect::<Vec<_>>();

    for game in &games {
        let home = id(&game.home);
        let away = id(&game.away);
        let pred = engine.predict(&home, &away, Context::Home).unwrap();
        engine.attach_outcome(pred.record_id, &id(&game.winner)).unwrap();
        engine.record_observation(&home, Context::Home, &game.home_observation()).unwrap();
        engine.record_observation(&away, Context::Away, &game.away_observation()).unwrap();
    }
    done.store(true, Ordering::Release);

    let reader_predictions: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(engine.ledger_len().unwrap(), games.len() + reader_predictions);
    assert_eq!(engine.stats().unwrap().total, games.len() as u64);
}

#[test]
fn concurrent_outcomes_resolve_each_record_once() {
    let engine = Arc::new(Engine::without_auxiliary(EngineConfig::default()).unwrap());
    let a = id("BOS");
    let b = id("TOR");
    let ids = (0..50)
        .map(|_| engine.predict(&a, &b, Context::Home).unwrap().record_id)
        .collect::<Vec<_>>();

    let workers = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let ids = ids.clone();
            let winner = a.clone();
            thread::spawn(move || {
                ids.iter()
                    .filter(|rid| engine.attach_outcome(**rid, &winner).is_ok())
                    .count()
            })
        })
        .collect::<Vec<_>>();

    let accepted: usize = workers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(accepted, ids.len());
    assert_eq!(engine.stats().unwrap().total, ids.len() as u64);
    assert_eq!(engine.recompute_stats().unwrap().total, ids.len() as u64);
}

#[test]
fn racing_learning_steps_are_all_counted() {
    let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
    for game in SyntheticLeague::new(8, 31).season(200) {
        let home = id(&game.home);
        let away = id(&game.away);
        let pred = engine.predict(&home, &away, Context::Home).unwrap();
        engine.attach_outcome(pred.record_id, &id(&game.winner)).unwrap();
        engine.record_observation(&home, Context::Home, &game.home_observation()).unwrap();
        engine.record_observation(&away, Context::Away, &game.away_observation()).unwrap();
    }
    let base_version = engine.current_weights().unwrap().version;
    let base_total = engine.stats().unwrap().total;
    assert!(base_version > 0);

    let pending = (0..200)
        .map(|i| {
            let a = id(&format!("T{:02}", i % 8 + 1));
            let b = id(&format!("T{:02}", (i + 3) % 8 + 1));
            let pred = engine.predict(&a, &b, Context::Home).unwrap();
            let winner = if i % 3 == 0 { b } else { a };
            (pred.record_id, winner)
        })
        .collect::<Vec<_>>();
    let pending = Arc::new(pending);

    let applied = Arc::new(AtomicU64::new(0));
    let workers = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let pending = Arc::clone(&pending);
            let applied = Arc::clone(&applied);
            thread::spawn(move || {
                // every worker walks every record from a different offset
                let n = pending.len();
                let mut won = 0usize;
                for k in 0..n {
                    let (rid, winner) = &pending[(k + t * 50) % n];
                    if let Ok(report) = engine.attach_outcome(*rid, winner) {
                        won += 1;
                        if report.learning.is_applied() {
                            applied.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                won
            })
        })
        .collect::<Vec<_>>();
    let accepted: usize = workers.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(accepted, pending.len());
    let applied = applied.load(Ordering::Relaxed);
    assert!(applied > 0);
    let weights = engine.current_weights().unwrap();
    assert_eq!(weights.version, base_version + applied);
    assert!(weights.weights.within_bounds(0.03, 0.65));
    assert!((weights.weights.sum() - 1.0).abs() < 1e-9);

    let stats = engine.stats().unwrap();
    assert_eq!(stats.total, base_total + pending.len() as u64);
    assert_eq!(engine.recompute_stats().unwrap(), stats);
}

#[test]
fn predict_many_matches_single_predictions() {
    let engine = Engine::without_auxiliary(EngineConfig::default()).unwrap();
    for game in SyntheticLeague::new(6, 21).season(120) {
        engine
            .record_observation(&id(&game.home), Context::Home, &game.home_observation())
            .unwrap();
        engine
            .record_observation(&id(&game.away), Context::Away, &game.away_observation())
            .unwrap();
    }
    let requests = vec![
        (id("T01"), id("T02"), Context::Home),
        (id("T03"), id("T04"), Context::Away),
        (id("T05"), id("T05"), Context::Home),
    ];
    let batch = engine.predict_many(&requests);
    assert_eq!(batch.len(), 3);
    assert!(batch[2].is_err());

    let single = engine.predict(&id("T01"), &id("T02"), Context::Home).unwrap();
    let first = batch[0].as_ref().unwrap();
    assert_eq!(first.probability_a, single.probability_a);
    assert_ne!(first.record_id, single.record_id);
}
