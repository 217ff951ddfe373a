use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::features::{Context, EntityId, FeatureVector};

/// Fixed-capacity ring of per-game feature vectors, oldest evicted first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWindow {
    slots: Vec<Option<FeatureVector>>,
    head: usize,
    len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub samples: usize,
    pub means: FeatureVector,
}

impl FeatureWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the evicted entry when the window was already full.
    pub fn push(&mut self, features: FeatureVector) -> Option<FeatureVector> {
        let cap = self.capacity();
        let evicted = self.slots[self.head].replace(features);
        self.head = (self.head + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
        evicted
    }

    /// Newest entry first.
    pub fn iter_recent(&self) -> impl Iterator<Item = &FeatureVector> + '_ {
        let cap = self.capacity();
        (0..self.len).filter_map(move |k| {
            let idx = (self.head + cap - 1 - k) % cap;
            self.slots[idx].as_ref()
        })
    }

    pub fn summarize(&self, decay: f64) -> WindowSummary {
        let mut sums = FeatureVector::new();
        let mut weights = FeatureVector::new();
        for (k, entry) in self.iter_recent().enumerate() {
            let w = decay.powi(k as i32);
            for (feature, value) in entry {
                if !value.is_finite() {
                    continue;
                }
                *sums.entry(*feature).or_insert(0.0) += w * value;
                *weights.entry(*feature).or_insert(0.0) += w;
            }
        }

        let means = sums
            .into_iter()
            .filter_map(|(feature, sum)| {
                let w = weights.get(&feature).copied().unwrap_or(0.0);
                let mean = sum / w;
                (w > 0.0 && mean.is_finite()).then_some((feature, mean))
            })
            .collect();
        WindowSummary {
            samples: self.len,
            means,
        }
    }

    pub(crate) fn is_consistent(&self) -> bool {
        let cap = self.capacity();
        if cap == 0 || self.len > cap || self.head >= cap {
            return false;
        }
        let filled = self.slots.iter().filter(|s| s.is_some()).count();
        filled == self.len
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    pub entity: EntityId,
    pub context: Context,
    pub window: FeatureWindow,
}

#[derive(Debug, Clone)]
pub struct FeatureStore {
    capacity: usize,
    windows: HashMap<(EntityId, Context), FeatureWindow>,
}

impl FeatureStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true when the oldest entry was evicted to make room.
    pub fn record_observation(
        &mut self,
        entity: &EntityId,
        context: Context,
        features: FeatureVector,
    ) -> bool {
        let capacity = self.capacity;
        self.windows
            .entry((entity.clone(), context))
            .or_insert_with(|| FeatureWindow::with_capacity(capacity))
            .push(features)
            .is_some()
    }

    pub fn window(&self, entity: &EntityId, context: Context) -> Option<&FeatureWindow> {
        self.windows.get(&(entity.clone(), context))
    }

    /// Unseen pairs get an empty window.
    pub fn get_window(&self, entity: &EntityId, context: Context) -> FeatureWindow {
        self.window(entity, context)
            .cloned()
            .unwrap_or_else(|| FeatureWindow::with_capacity(self.capacity))
    }

    pub fn sample_count(&self, entity: &EntityId, context: Context) -> usize {
        self.window(entity, context).map_or(0, FeatureWindow::len)
    }

    pub fn summarize(
        &self,
        entity: &EntityId,
        context: Context,
        min_samples: usize,
        decay: f64,
    ) -> Result<WindowSummary> {
        let Some(window) = self.window(entity, context) else {
            return Err(insufficient(entity, context, 0, min_samples));
        };
        if window.len() < min_samples {
            return Err(insufficient(entity, context, window.len(), min_samples));
        }
        Ok(window.summarize(decay))
    }

    /// Like `summarize` but never refuses; used for flagged low-confidence output.
    pub fn summarize_lenient(&self, entity: &EntityId, context: Context, decay: f64) -> WindowSummary {
        self.window(entity, context)
            .map(|w| w.summarize(decay))
            .unwrap_or_default()
    }

    pub fn entities(&self) -> Vec<(EntityId, Context)> {
        let mut keys = self.windows.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn to_entries(&self) -> Vec<WindowEntry> {
        let mut entries = self
            .windows
            .iter()
            .map(|((entity, context), window)| WindowEntry {
                entity: entity.clone(),
                context: *context,
                window: window.clone(),
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| (&a.entity, a.context).cmp(&(&b.entity, b.context)));
        entries
    }

    pub fn from_entries(capacity: usize, entries: Vec<WindowEntry>) -> Result<Self> {
        let mut store = Self::new(capacity);
        for entry in entries {
            if !entry.window.is_consistent() || entry.window.capacity() != store.capacity {
                return Err(EngineError::Persistence(format!(
                    "corrupt feature window for {} ({})",
                    entry.entity, entry.context
                )));
            }
            store
                .windows
                .insert((entry.entity, entry.context), entry.window);
        }
        Ok(store)
    }
}

fn insufficient(entity: &EntityId, context: Context, have: usize, need: usize) -> EngineError {
    EngineError::InsufficientData {
        entity: entity.clone(),
        context,
        have,
        need,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Feature;

    fn obs(xg: f64) -> FeatureVector {
        FeatureVector::from([(Feature::ExpectedGoalsFor, xg)])
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut w = FeatureWindow::with_capacity(3);
        assert!(w.push(obs(1.0)).is_none());
        assert!(w.push(obs(2.0)).is_none());
        assert!(w.push(obs(3.0)).is_none());
        let evicted = w.push(obs(4.0)).unwrap();
        assert_eq!(evicted.get(&Feature::ExpectedGoalsFor), Some(&1.0));
        assert_eq!(w.len(), 3);

        let recent = w
            .iter_recent()
            .map(|v| v[&Feature::ExpectedGoalsFor])
            .collect::<Vec<_>>();
        assert_eq!(recent, vec![4.0, 3.0, 2.0]);
        assert!(w.is_consistent());
    }

    #[test]
    fn recency_weighting_favours_latest_game() {
        let mut w = FeatureWindow::with_capacity(5);
        w.push(obs(0.0));
        w.push(obs(2.0));

        let plain = w.summarize(1.0);
        assert!((plain.means[&Feature::ExpectedGoalsFor] - 1.0).abs() < 1e-12);

        let decayed = w.summarize(0.5);
        // (2.0 * 1 + 0.0 * 0.5) / 1.5
        assert!((decayed.means[&Feature::ExpectedGoalsFor] - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn partial_vectors_only_average_where_present() {
        let mut w = FeatureWindow::with_capacity(5);
        w.push(obs(1.0));
        w.push(FeatureVector::from([(Feature::Hits, 20.0)]));
        let s = w.summarize(1.0);
        assert_eq!(s.samples, 2);
        assert!((s.means[&Feature::ExpectedGoalsFor] - 1.0).abs() < 1e-12);
        assert!((s.means[&Feature::Hits] - 20.0).abs() < 1e-12);
        assert!(!s.means.contains_key(&Feature::GoalieGsax));
    }

    #[test]
    fn cold_start_is_reported_not_guessed() {
        let mut store = FeatureStore::new(20);
        let bos = EntityId::parse("BOS").unwrap();
        let err = store.summarize(&bos, Context::Home, 3, 0.85).unwrap_err();
        assert!(err.is_insufficient_data());

        store.record_observation(&bos, Context::Home, obs(2.0));
        store.record_observation(&bos, Context::Home, obs(2.0));
        assert!(store.summarize(&bos, Context::Home, 3, 0.85).is_err());
        store.record_observation(&bos, Context::Home, obs(2.0));
        assert!(store.summarize(&bos, Context::Home, 3, 0.85).is_ok());

        // contexts are separate windows
        assert_eq!(store.sample_count(&bos, Context::Away), 0);
        assert!(store.get_window(&bos, Context::Away).is_empty());
    }

    #[test]
    fn overflowing_sums_leave_no_mean() {
        let mut w = FeatureWindow::with_capacity(5);
        for _ in 0..3 {
            w.push(FeatureVector::from([(Feature::ExpectedGoalsFor, f64::MAX), (Feature::Hits, 20.0)]));
        }
        let s = w.summarize(0.85);
        assert!(!s.means.contains_key(&Feature::ExpectedGoalsFor));
        assert!((s.means[&Feature::Hits] - 20.0).abs() < 1e-9);
    }
}
