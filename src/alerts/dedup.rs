//! Alert deduplication: last-write-wins by detection identity
//!
//! Two raw alerts are the same logical detection iff (rule id, entity key,
//! ts_first, ts_last) match exactly. The alert id is regenerated per
//! physical write and deliberately excluded, so redelivery converges to one
//! record no matter how many times the detection is rewritten. "Last" means
//! arrival order, not event time: under at-least-once delivery the newest
//! write is the authoritative one.

use crate::alerts::types::{DedupKey, DeduplicatedAlert, RawAlert};
use std::collections::HashMap;
use std::sync::Mutex;

/// Pure merge: the incoming write replaces the existing record's mutable
/// fields (status, context, and the rest of the projection); the key fields
/// are equal by definition.
pub fn merge(existing: &DeduplicatedAlert, incoming: &RawAlert, now: i64) -> DeduplicatedAlert {
    debug_assert_eq!(existing.key(), incoming.dedup_key());
    DeduplicatedAlert::from_raw(incoming, now)
}

struct DedupEntry {
    alert: DeduplicatedAlert,
    dirty: bool,
}

/// In-memory latest-wins projection, flushed periodically as a
/// replace-by-key write into the store.
pub struct AlertDeduplicator {
    entries: Mutex<HashMap<DedupKey, DedupEntry>>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl AlertDeduplicator {
    pub fn new() -> Self {
        Self::new_with_timestamp_fn(Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn new_with_timestamp_fn(now_fn: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            now_fn,
        }
    }

    /// Warm start from the persisted projection. Loaded records are clean;
    /// only subsequent absorbs are re-flushed.
    pub fn preload(&self, alerts: Vec<DeduplicatedAlert>) {
        let mut entries = self.entries.lock().unwrap();
        for alert in alerts {
            entries.insert(
                alert.key(),
                DedupEntry {
                    alert,
                    dirty: false,
                },
            );
        }
    }

    /// Fold one raw alert into the projection and return the resulting
    /// logical record.
    pub fn absorb(&self, raw: &RawAlert) -> DeduplicatedAlert {
        let now = (self.now_fn)();
        let key = raw.dedup_key();
        let mut entries = self.entries.lock().unwrap();

        let merged = match entries.get(&key) {
            Some(entry) => merge(&entry.alert, raw, now),
            None => DeduplicatedAlert::from_raw(raw, now),
        };

        entries.insert(
            key,
            DedupEntry {
                alert: merged.clone(),
                dirty: true,
            },
        );
        merged
    }

    /// Re-mark records dirty after a failed flush so the next tick retries
    /// them. Values are not touched: a concurrent newer write wins anyway.
    pub fn restore_dirty(&self, alerts: &[DeduplicatedAlert]) {
        let mut entries = self.entries.lock().unwrap();
        for alert in alerts {
            if let Some(entry) = entries.get_mut(&alert.key()) {
                entry.dirty = true;
            }
        }
    }

    /// Records written since the last drain, for the periodic flush.
    pub fn drain_dirty(&self) -> Vec<DeduplicatedAlert> {
        let mut entries = self.entries.lock().unwrap();
        let mut dirty = Vec::new();
        for entry in entries.values_mut() {
            if entry.dirty {
                entry.dirty = false;
                dirty.push(entry.alert.clone());
            }
        }
        dirty
    }

    /// Drop settled records last written before `cutoff`. Dirty records are
    /// kept until they flush; the persisted rows are purged separately.
    pub fn evict_expired(&self, cutoff: i64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.dirty || entry.alert.updated_at >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::{AlertSource, AlertStatus, Severity};

    fn make_raw(entity: &str, ts_first: i64, ts_last: i64, writer: &str) -> RawAlert {
        RawAlert {
            ts: ts_last,
            alert_id: uuid::Uuid::new_v4().to_string(),
            rule_id: 1,
            rule_name: "brute force".to_string(),
            severity: Severity::High,
            ts_first,
            ts_last,
            window_s: 30,
            entity_key: entity.to_string(),
            hits: 5,
            context: serde_json::json!({"writer": writer}),
            source: AlertSource::Stream,
            status: AlertStatus::Open,
        }
    }

    #[test]
    fn test_redelivery_collapses_to_one_record() {
        let dedup = AlertDeduplicator::new_with_timestamp_fn(Box::new(|| 1_000));

        // The same detection written three times with different alert ids
        for _ in 0..3 {
            dedup.absorb(&make_raw("10.0.0.1", 0, 29, "a"));
        }
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_last_write_wins_on_context() {
        let dedup = AlertDeduplicator::new_with_timestamp_fn(Box::new(|| 1_000));

        dedup.absorb(&make_raw("10.0.0.1", 0, 29, "first"));
        let merged = dedup.absorb(&make_raw("10.0.0.1", 0, 29, "second"));

        assert_eq!(merged.context["writer"], "second");
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_status_follows_latest_write() {
        let dedup = AlertDeduplicator::new_with_timestamp_fn(Box::new(|| 1_000));

        dedup.absorb(&make_raw("10.0.0.1", 0, 29, "a"));
        let mut closed = make_raw("10.0.0.1", 0, 29, "a");
        closed.status = AlertStatus::Closed;
        let merged = dedup.absorb(&closed);
        assert_eq!(merged.status, AlertStatus::Closed);
    }

    #[test]
    fn test_distinct_windows_stay_distinct() {
        let dedup = AlertDeduplicator::new_with_timestamp_fn(Box::new(|| 1_000));

        dedup.absorb(&make_raw("10.0.0.1", 0, 29, "a"));
        dedup.absorb(&make_raw("10.0.0.1", 30, 59, "a"));
        dedup.absorb(&make_raw("10.0.0.2", 0, 29, "a"));
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_drain_dirty_marks_clean() {
        let dedup = AlertDeduplicator::new_with_timestamp_fn(Box::new(|| 1_000));

        dedup.absorb(&make_raw("10.0.0.1", 0, 29, "a"));
        assert_eq!(dedup.drain_dirty().len(), 1);
        assert!(dedup.drain_dirty().is_empty());

        // A new write re-dirties only that record
        dedup.absorb(&make_raw("10.0.0.1", 0, 29, "b"));
        dedup.absorb(&make_raw("10.0.0.2", 0, 29, "a"));
        assert_eq!(dedup.drain_dirty().len(), 2);
    }

    #[test]
    fn test_evict_expired_keeps_dirty_and_recent() {
        let now = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(1_000));
        let now_clone = now.clone();
        let dedup = AlertDeduplicator::new_with_timestamp_fn(Box::new(move || {
            now_clone.load(std::sync::atomic::Ordering::Relaxed)
        }));

        dedup.absorb(&make_raw("10.0.0.1", 0, 29, "a"));
        now.store(9_000, std::sync::atomic::Ordering::Relaxed);
        dedup.absorb(&make_raw("10.0.0.2", 0, 29, "a"));
        dedup.drain_dirty();

        // The first record settled at updated_at=1000 and ages out
        assert_eq!(dedup.evict_expired(5_000), 1);
        assert_eq!(dedup.len(), 1);

        // A dirty record never ages out, even past the cutoff
        dedup.absorb(&make_raw("10.0.0.3", 0, 29, "a"));
        assert_eq!(dedup.evict_expired(10_000), 1);
        assert_eq!(dedup.len(), 1);
        assert_eq!(dedup.drain_dirty().len(), 1);
    }

    #[test]
    fn test_preload_is_clean() {
        let dedup = AlertDeduplicator::new_with_timestamp_fn(Box::new(|| 1_000));
        let record = DeduplicatedAlert::from_raw(&make_raw("10.0.0.1", 0, 29, "a"), 500);
        dedup.preload(vec![record]);

        assert_eq!(dedup.len(), 1);
        assert!(dedup.drain_dirty().is_empty());
    }
}
