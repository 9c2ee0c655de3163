//! Correlation rule definitions and the hot-reloadable snapshot store
//!
//! Rules are owned exclusively by the store; the correlators hold read-only
//! snapshot references. A reload swaps the whole snapshot atomically, so an
//! evaluation that started on the previous snapshot finishes on it.

pub mod expr;

use crate::alerts::types::Severity;
use crate::error::EngineError;
use crate::store::RuleSource;
use expr::Expr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Stream rule kinds. Only threshold rules are executed; rows with an
/// unknown kind are loaded disabled and logged once per reload.
pub const KIND_THRESHOLD: &str = "threshold";

/// A stream correlation rule: count events matching `expr` per entity over
/// a sliding window and alert when the count reaches `threshold`.
#[derive(Debug, Clone)]
pub struct StreamRule {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub kind: String,
    pub severity: Severity,
    /// Event field whose value scopes the per-entity window.
    pub entity_field: String,
    pub expr_text: String,
    /// Compiled predicate; None means the rule is disabled (parse failure
    /// or empty expression).
    pub expr: Option<Expr>,
    pub window_s: i64,
    pub threshold: u32,
    /// Minimum spacing between consecutive alerts for one entity, in event
    /// time. 0 disables suppression: a sustained burst re-fires per event.
    pub cooldown_s: i64,
    /// Grouping fields for the aggregator. Empty means the default
    /// (rule id, entity key) grouping.
    pub group_by: Vec<String>,
}

impl StreamRule {
    /// Compile the predicate and check invariants. Returns the load-time
    /// error when the rule must stay disabled; the rule itself is kept in
    /// the snapshot so operators can see it reported.
    pub fn compile(&mut self) -> Result<(), EngineError> {
        if self.window_s <= 0 || self.threshold == 0 {
            self.expr = None;
            return Err(EngineError::RuleDefinition {
                rule_id: self.id,
                reason: format!(
                    "window_s and threshold must be positive (got {}, {})",
                    self.window_s, self.threshold
                ),
            });
        }

        if self.kind != KIND_THRESHOLD {
            self.expr = None;
            return Err(EngineError::RuleDefinition {
                rule_id: self.id,
                reason: format!("unsupported rule kind {:?}", self.kind),
            });
        }

        match expr::parse(&self.expr_text) {
            Ok(compiled) => {
                self.expr = Some(compiled);
                Ok(())
            }
            Err(e) => {
                self.expr = None;
                Err(EngineError::RuleDefinition {
                    rule_id: self.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Whether the stream correlator evaluates this rule at all.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.expr.is_some()
    }

    pub fn matches(&self, event: &crate::events::EventRecord) -> bool {
        match &self.expr {
            Some(expr) => expr.matches(event),
            None => false,
        }
    }
}

/// A batch correlation rule: a parameterized SQL template executed on a
/// fixed cadence with `{WINDOW_S}` replaced by the lookback.
#[derive(Debug, Clone)]
pub struct BatchRule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub interval_s: i64,
    pub lookback_s: i64,
    pub sql_template: String,
}

pub const WINDOW_PLACEHOLDER: &str = "{WINDOW_S}";

impl BatchRule {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.interval_s <= 0 || self.lookback_s <= 0 {
            return Err(EngineError::RuleDefinition {
                rule_id: self.id,
                reason: format!(
                    "interval_s and lookback_s must be positive (got {}, {})",
                    self.interval_s, self.lookback_s
                ),
            });
        }
        Ok(())
    }

    /// Substitute the lookback into the template.
    pub fn final_sql(&self) -> String {
        self.sql_template
            .replace(WINDOW_PLACEHOLDER, &self.lookback_s.to_string())
    }
}

/// Immutable view over the rule tables at one load instant.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    pub stream: Vec<StreamRule>,
    pub batch: Vec<BatchRule>,
    pub loaded_at: i64,
}

/// Snapshot holder. `reload` swaps the inner Arc; readers clone it and keep
/// evaluating against a consistent rule set with no torn reads.
pub struct RuleStore {
    source: Arc<dyn RuleSource>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
}

impl RuleStore {
    pub fn new(source: Arc<dyn RuleSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
        }
    }

    /// Re-read persisted definitions and atomically swap the snapshot.
    /// Failure keeps the previous snapshot active and is never fatal to a
    /// running engine.
    pub async fn reload(&self) -> Result<(), EngineError> {
        let mut stream = self.source.load_stream_rules().await?;
        let batch_all = self.source.load_batch_rules().await?;

        let mut disabled = 0usize;
        for rule in stream.iter_mut() {
            if !rule.enabled {
                continue;
            }
            if let Err(e) = rule.compile() {
                disabled += 1;
                log::error!("rule disabled at load: {}", e);
            }
        }

        let mut batch = Vec::with_capacity(batch_all.len());
        for rule in batch_all {
            if !rule.enabled {
                continue;
            }
            match rule.validate() {
                Ok(()) => batch.push(rule),
                Err(e) => {
                    disabled += 1;
                    log::error!("batch rule disabled at load: {}", e);
                }
            }
        }

        let stream: Vec<StreamRule> = stream.into_iter().filter(|r| r.enabled).collect();

        let snapshot = Arc::new(RuleSnapshot {
            loaded_at: chrono::Utc::now().timestamp(),
            stream,
            batch,
        });

        log::info!(
            "loaded rule snapshot: {} stream, {} batch, {} disabled at load",
            snapshot.stream.len(),
            snapshot.batch.len(),
            disabled
        );

        *self.snapshot.write().unwrap() = snapshot;
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Lookup used by the aggregator to resolve a rule's grouping fields.
    pub fn stream_rule(&self, rule_id: i64) -> Option<StreamRule> {
        self.snapshot()
            .stream
            .iter()
            .find(|r| r.id == rule_id)
            .cloned()
    }
}

/// Periodic snapshot reload. Errors are logged and the previous snapshot
/// stays active until the next tick.
pub async fn run_rule_reload_task(
    rules: Arc<RuleStore>,
    reload_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(reload_interval);
    timer.tick().await; // first tick fires immediately; initial load already done

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = rules.reload().await {
                    log::error!("rule snapshot reload failed, keeping previous: {}", e);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
