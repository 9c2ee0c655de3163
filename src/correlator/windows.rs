//! Per-entity sliding window state for the stream correlator
//!
//! Windows are keyed by (rule id, entity value) and sharded by key hash so
//! observations for the same entity serialize while different entities
//! proceed on different shards. Entries are ordered by event timestamp, not
//! arrival order, so bounded out-of-order delivery trims correctly. Each
//! entry remembers the delivery id that produced it; redelivery of the same
//! delivery never double-counts.

use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

const SHARD_COUNT: usize = 16;

/// Result of one window observation: the retained hit count and the bounds
/// of the retained window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub hits: u32,
    pub ts_first: i64,
    pub ts_last: i64,
    /// Event-time of the last alert fired for this window, for optional
    /// cooldown suppression.
    pub last_fired: Option<i64>,
}

#[derive(Debug)]
struct EntityWindow {
    /// (event timestamp, delivery id), kept sorted by timestamp.
    entries: Vec<(i64, u64)>,
    /// (event timestamp, evidence sample), trimmed with the entries.
    evidence: Vec<(i64, Value)>,
    window_s: i64,
    last_fired: Option<i64>,
    /// Wall-clock instant of the last touch, for idle eviction.
    last_touched: i64,
}

impl EntityWindow {
    fn trim(&mut self) {
        let newest = match self.entries.iter().map(|(ts, _)| *ts).max() {
            Some(ts) => ts,
            None => return,
        };
        let cutoff = newest - self.window_s;
        self.entries.retain(|(ts, _)| *ts >= cutoff);
        self.evidence.retain(|(ts, _)| *ts >= cutoff);
    }
}

type WindowKey = (i64, String);

pub struct EntityWindowTracker {
    shards: Vec<Mutex<HashMap<WindowKey, EntityWindow>>>,
    max_evidence: usize,
    idle_ceiling_s: i64,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl EntityWindowTracker {
    pub fn new(max_evidence: usize, idle_ceiling_s: i64) -> Self {
        Self::new_with_timestamp_fn(
            max_evidence,
            idle_ceiling_s,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    /// Deterministic clock injection for tests.
    pub fn new_with_timestamp_fn(
        max_evidence: usize,
        idle_ceiling_s: i64,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            max_evidence,
            idle_ceiling_s,
            now_fn,
        }
    }

    fn shard_for(&self, rule_id: i64, entity_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        rule_id.hash(&mut hasher);
        entity_key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Record one event occurrence and return the resulting window state.
    ///
    /// Entries older than `newest - window_s` are dropped first, the new
    /// entry is inserted in timestamp order, and the retained count and
    /// bounds come back. Re-observing a delivery id already in the window
    /// is a no-op apart from the trim.
    pub fn observe(
        &self,
        rule_id: i64,
        entity_key: &str,
        window_s: i64,
        delivery_id: u64,
        event_ts: i64,
        evidence: Option<Value>,
    ) -> Observation {
        let shard = self.shard_for(rule_id, entity_key);
        let mut windows = self.shards[shard].lock().unwrap();

        let window = windows
            .entry((rule_id, entity_key.to_string()))
            .or_insert_with(|| EntityWindow {
                entries: Vec::new(),
                evidence: Vec::new(),
                window_s,
                last_fired: None,
                last_touched: 0,
            });

        // The rule's window may have been edited between reloads
        window.window_s = window_s;
        window.last_touched = (self.now_fn)();

        let already_seen = window.entries.iter().any(|(_, id)| *id == delivery_id);
        if !already_seen {
            let pos = window
                .entries
                .partition_point(|(ts, _)| *ts <= event_ts);
            window.entries.insert(pos, (event_ts, delivery_id));

            if window.evidence.len() < self.max_evidence {
                if let Some(sample) = evidence {
                    window.evidence.push((event_ts, sample));
                }
            }
        }

        window.trim();

        let hits = window.entries.len() as u32;
        let ts_first = window.entries.first().map(|(ts, _)| *ts).unwrap_or(event_ts);
        let ts_last = window.entries.last().map(|(ts, _)| *ts).unwrap_or(event_ts);

        Observation {
            hits,
            ts_first,
            ts_last,
            last_fired: window.last_fired,
        }
    }

    /// Evidence samples currently retained for a window, oldest first.
    pub fn collect_evidence(&self, rule_id: i64, entity_key: &str) -> Vec<Value> {
        let shard = self.shard_for(rule_id, entity_key);
        let windows = self.shards[shard].lock().unwrap();
        windows
            .get(&(rule_id, entity_key.to_string()))
            .map(|w| w.evidence.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Record that an alert fired for this window, in event time.
    pub fn mark_fired(&self, rule_id: i64, entity_key: &str, fired_ts: i64) {
        let shard = self.shard_for(rule_id, entity_key);
        let mut windows = self.shards[shard].lock().unwrap();
        if let Some(window) = windows.get_mut(&(rule_id, entity_key.to_string())) {
            window.last_fired = Some(fired_ts);
        }
    }

    /// Evict windows untouched past the idle ceiling. Returns the number of
    /// windows dropped.
    pub fn sweep(&self) -> usize {
        let now = (self.now_fn)();
        let mut evicted = 0;
        for shard in &self.shards {
            let mut windows = shard.lock().unwrap();
            let before = windows.len();
            windows.retain(|_, w| now - w.last_touched <= self.idle_ceiling_s);
            evicted += before - windows.len();
        }
        evicted
    }

    /// Number of live entity windows across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> EntityWindowTracker {
        EntityWindowTracker::new_with_timestamp_fn(5, 900, Box::new(|| 10_000))
    }

    #[test]
    fn test_threshold_scenario_counts_and_bounds() {
        // Events at t=0,5,10,20,29 with a 30s window -> hits=5, bounds [0,29]
        let t = tracker();
        let mut obs = None;
        for (i, ts) in [0i64, 5, 10, 20, 29].iter().enumerate() {
            obs = Some(t.observe(1, "10.0.0.1", 30, i as u64, *ts, None));
        }
        let obs = obs.unwrap();
        assert_eq!(obs.hits, 5);
        assert_eq!(obs.ts_first, 0);
        assert_eq!(obs.ts_last, 29);
    }

    #[test]
    fn test_expired_window_starts_fresh_count() {
        // A 6th event at t=60 is outside [30,60]; prior entries drop
        let t = tracker();
        for (i, ts) in [0i64, 5, 10, 20, 29].iter().enumerate() {
            t.observe(1, "10.0.0.1", 30, i as u64, *ts, None);
        }
        let obs = t.observe(1, "10.0.0.1", 30, 5, 60, None);
        assert_eq!(obs.hits, 1);
        assert_eq!(obs.ts_first, 60);
        assert_eq!(obs.ts_last, 60);
    }

    #[test]
    fn test_out_of_order_arrival_ordered_by_event_time() {
        let t = tracker();
        t.observe(1, "10.0.0.1", 30, 0, 20, None);
        t.observe(1, "10.0.0.1", 30, 1, 29, None);
        // Late arrival with an older event timestamp still in the window
        let obs = t.observe(1, "10.0.0.1", 30, 2, 5, None);
        assert_eq!(obs.hits, 3);
        assert_eq!(obs.ts_first, 5);
        assert_eq!(obs.ts_last, 29);

        // A late arrival older than latest - window never counts
        let obs = t.observe(1, "10.0.0.1", 30, 3, -5, None);
        assert_eq!(obs.hits, 3);
        assert_eq!(obs.ts_first, 5);
    }

    #[test]
    fn test_redelivery_does_not_double_count() {
        let t = tracker();
        t.observe(1, "10.0.0.1", 30, 7, 10, None);
        let obs = t.observe(1, "10.0.0.1", 30, 7, 10, None);
        assert_eq!(obs.hits, 1);
    }

    #[test]
    fn test_entities_and_rules_isolated() {
        let t = tracker();
        t.observe(1, "10.0.0.1", 30, 0, 10, None);
        t.observe(1, "10.0.0.2", 30, 1, 10, None);
        t.observe(2, "10.0.0.1", 30, 2, 10, None);

        assert_eq!(t.len(), 3);
        let obs = t.observe(1, "10.0.0.1", 30, 3, 12, None);
        assert_eq!(obs.hits, 2);
    }

    #[test]
    fn test_evidence_capped_and_trimmed() {
        let t = EntityWindowTracker::new_with_timestamp_fn(2, 900, Box::new(|| 10_000));
        for (i, ts) in [0i64, 5, 10].iter().enumerate() {
            t.observe(
                1,
                "10.0.0.1",
                30,
                i as u64,
                *ts,
                Some(serde_json::json!({"ts": ts})),
            );
        }
        // Capped at 2 samples, oldest first
        let evidence = t.collect_evidence(1, "10.0.0.1");
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0]["ts"], 0);

        // Window expiry drops the stale samples with the entries
        t.observe(1, "10.0.0.1", 30, 3, 100, None);
        let evidence = t.collect_evidence(1, "10.0.0.1");
        assert!(evidence.is_empty());
    }

    #[test]
    fn test_idle_sweep_evicts() {
        let now = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(10_000));
        let now_clone = now.clone();
        let t = EntityWindowTracker::new_with_timestamp_fn(
            5,
            900,
            Box::new(move || now_clone.load(std::sync::atomic::Ordering::Relaxed)),
        );

        t.observe(1, "10.0.0.1", 30, 0, 10, None);
        assert_eq!(t.len(), 1);

        // Still inside the idle ceiling
        now.store(10_500, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(t.sweep(), 0);

        now.store(11_000, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(t.sweep(), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn test_mark_fired_round_trip() {
        let t = tracker();
        let obs = t.observe(1, "10.0.0.1", 30, 0, 10, None);
        assert_eq!(obs.last_fired, None);

        t.mark_fired(1, "10.0.0.1", 10);
        let obs = t.observe(1, "10.0.0.1", 30, 1, 12, None);
        assert_eq!(obs.last_fired, Some(10));
    }
}
