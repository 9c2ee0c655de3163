//! Operational surface: health signal and per-rule execution metrics
//!
//! Metrics are emitted, never consumed by the engine itself. Counters are
//! plain atomics; per-rule batch execution stats live behind a mutex since
//! they are touched once per tick, not per event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Engine health as exposed to orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ready,
    Degraded,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ready => "ready",
            Health::Degraded => "degraded",
        }
    }
}

/// Outcome record for the most recent executions of one batch rule.
#[derive(Debug, Clone, Default)]
pub struct RuleExecution {
    pub last_run_ts: i64,
    pub last_duration_ms: u64,
    pub last_rows: usize,
    pub runs: u64,
    pub error_count: u64,
    pub skipped_ticks: u64,
}

#[derive(Default)]
pub struct EngineMetrics {
    events_processed: AtomicU64,
    raw_alerts_emitted: AtomicU64,
    eval_errors: AtomicU64,
    dedup_records: AtomicU64,
    groups_flushed: AtomicU64,
    delivery_faults: AtomicU64,
    degraded: AtomicBool,
    batch: Mutex<HashMap<i64, RuleExecution>>,
    stream_errors: Mutex<HashMap<i64, u64>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_events(&self, count: u64) {
        self.events_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_raw_alerts(&self, count: u64) {
        self.raw_alerts_emitted.fetch_add(count, Ordering::Relaxed);
    }

    /// Per-rule evaluation fault. Counted globally and per rule so operators
    /// can see which rule is misbehaving.
    pub fn record_eval_error(&self, rule_id: i64) {
        self.eval_errors.fetch_add(1, Ordering::Relaxed);
        let mut per_rule = self.stream_errors.lock().unwrap();
        *per_rule.entry(rule_id).or_insert(0) += 1;
    }

    pub fn record_dedup_flush(&self, count: u64) {
        self.dedup_records.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_group_flush(&self, count: u64) {
        self.groups_flushed.fetch_add(count, Ordering::Relaxed);
    }

    /// Delivery fault on the bus or the write path. Flips health to
    /// degraded until the next successful write.
    pub fn record_delivery_fault(&self) {
        self.delivery_faults.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub fn record_delivery_ok(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }

    pub fn record_batch_run(&self, rule_id: i64, ts: i64, duration_ms: u64, rows: usize) {
        let mut batch = self.batch.lock().unwrap();
        let entry = batch.entry(rule_id).or_default();
        entry.last_run_ts = ts;
        entry.last_duration_ms = duration_ms;
        entry.last_rows = rows;
        entry.runs += 1;
    }

    pub fn record_batch_error(&self, rule_id: i64, ts: i64) {
        let mut batch = self.batch.lock().unwrap();
        let entry = batch.entry(rule_id).or_default();
        entry.last_run_ts = ts;
        entry.error_count += 1;
    }

    pub fn record_batch_skip(&self, rule_id: i64) {
        let mut batch = self.batch.lock().unwrap();
        batch.entry(rule_id).or_default().skipped_ticks += 1;
    }

    pub fn health(&self) -> Health {
        if self.degraded.load(Ordering::Relaxed) {
            Health::Degraded
        } else {
            Health::Ready
        }
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn raw_alerts_emitted(&self) -> u64 {
        self.raw_alerts_emitted.load(Ordering::Relaxed)
    }

    pub fn eval_errors(&self) -> u64 {
        self.eval_errors.load(Ordering::Relaxed)
    }

    pub fn batch_execution(&self, rule_id: i64) -> Option<RuleExecution> {
        self.batch.lock().unwrap().get(&rule_id).cloned()
    }

    /// One-line operational summary, logged periodically by the runtime.
    pub fn log_summary(&self) {
        log::info!(
            "📊 engine: {} events, {} raw alerts, {} eval errors, {} delivery faults | health: {}",
            self.events_processed.load(Ordering::Relaxed),
            self.raw_alerts_emitted.load(Ordering::Relaxed),
            self.eval_errors.load(Ordering::Relaxed),
            self.delivery_faults.load(Ordering::Relaxed),
            self.health().as_str(),
        );
    }
}
