//! Batch correlator: scheduled meta-queries over raised alerts
//!
//! Each enabled batch rule runs on its own interval. The engine's job is
//! window substitution, scheduling, and outcome capture; the template
//! itself is a self-contained read+insert statement. A rule never has two
//! executions in flight: if the previous run is still live when the next
//! tick fires, that tick is skipped and logged, not queued.

use crate::error::EngineError;
use crate::ops::{EngineMetrics, Health};
use crate::rules::{BatchRule, RuleStore};
use crate::store::AlertSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub struct BatchCorrelator {
    rules: Arc<RuleStore>,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<EngineMetrics>,
    /// Per-rule execution locks (at-most-one-in-flight).
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    exec_timeout: Duration,
}

impl BatchCorrelator {
    pub fn new(
        rules: Arc<RuleStore>,
        sink: Arc<dyn AlertSink>,
        metrics: Arc<EngineMetrics>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            rules,
            sink,
            metrics,
            locks: Mutex::new(HashMap::new()),
            exec_timeout,
        }
    }

    fn lock_for(&self, rule_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(rule_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Execute one rule now. Returns rows affected, or the skip/error that
    /// kept it from completing. Errors are retried on the next scheduled
    /// tick only; the rule is never auto-disabled.
    pub async fn execute_rule(&self, rule: &BatchRule) -> Result<usize, EngineError> {
        let lock = self.lock_for(rule.id);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::warn!(
                    "batch rule {} ({}) still running, skipping tick",
                    rule.id,
                    rule.name
                );
                self.metrics.record_batch_skip(rule.id);
                return Err(EngineError::Concurrency(format!(
                    "rule {} already in flight",
                    rule.id
                )));
            }
        };

        // The alert history is eventually consistent; during a delivery
        // fault the stream side is behind, so the read may undercount
        if self.metrics.health() == Health::Degraded {
            log::warn!(
                "batch rule {} ({}) reading alert history while delivery is degraded, results may undercount",
                rule.id,
                rule.name
            );
        }

        let sql = rule.final_sql();
        let started = std::time::Instant::now();
        let now = chrono::Utc::now().timestamp();

        let result = tokio::time::timeout(self.exec_timeout, self.sink.execute_template(&sql))
            .await
            .unwrap_or(Err(EngineError::Timeout(self.exec_timeout)));

        match result {
            Ok(rows) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.metrics
                    .record_batch_run(rule.id, now, duration_ms, rows);
                log::info!(
                    "batch rule {} ({}) executed: {} rows in {}ms",
                    rule.id,
                    rule.name,
                    rows,
                    duration_ms
                );
                Ok(rows)
            }
            Err(e) => {
                self.metrics.record_batch_error(rule.id, now);
                // Store unavailability degrades health; a timeout is
                // retried on the next tick without flipping it
                if e.is_delivery_fault() {
                    self.metrics.record_delivery_fault();
                }
                log::error!("batch rule {} ({}) failed: {}", rule.id, rule.name, e);
                Err(e)
            }
        }
    }

    /// Run every enabled batch rule once, sequentially. Used by the
    /// one-shot binary and at-startup warm runs. Returns (executed, failed).
    pub async fn run_all_once(&self) -> (usize, usize) {
        let snapshot = self.rules.snapshot();
        let mut executed = 0;
        let mut failed = 0;
        for rule in &snapshot.batch {
            match self.execute_rule(rule).await {
                Ok(_) => executed += 1,
                Err(_) => failed += 1,
            }
        }
        (executed, failed)
    }
}

/// Pick the rules due at `now` and push their next-due instants forward.
/// Rules seen for the first time are due immediately.
fn due_rules(
    snapshot: &crate::rules::RuleSnapshot,
    now: i64,
    next_due: &mut HashMap<i64, i64>,
) -> Vec<BatchRule> {
    let mut due = Vec::new();
    for rule in &snapshot.batch {
        let due_at = *next_due.entry(rule.id).or_insert(now);
        if now >= due_at {
            next_due.insert(rule.id, now + rule.interval_s);
            due.push(rule.clone());
        }
    }
    // Forget rules that were removed or disabled
    next_due.retain(|id, _| snapshot.batch.iter().any(|r| r.id == *id));
    due
}

/// Scheduler loop. Executions for different rules run in parallel on
/// spawned tasks; the per-rule lock inside `execute_rule` serializes a rule
/// against itself.
pub async fn run_batch_scheduler(
    correlator: Arc<BatchCorrelator>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("batch scheduler started (poll: {:?})", poll);
    let mut timer = tokio::time::interval(poll);
    let mut next_due: HashMap<i64, i64> = HashMap::new();

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let now = chrono::Utc::now().timestamp();
                let snapshot = correlator.rules.snapshot();
                for rule in due_rules(&snapshot, now, &mut next_due) {
                    let correlator = correlator.clone();
                    tokio::spawn(async move {
                        // Skip/error outcomes are logged and recorded inside
                        let _ = correlator.execute_rule(&rule).await;
                    });
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("batch scheduler stopped");
}
