//! Engine error taxonomy
//!
//! Faults are scoped as narrowly as possible: a bad rule disables that rule,
//! a bad event/rule pair is counted and skipped, and only startup-time
//! unavailability of the store or the bus is allowed to be fatal.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed rule definition (unparseable predicate or template).
    /// The rule is disabled and reported at load time, never executed.
    #[error("rule {rule_id} definition invalid: {reason}")]
    RuleDefinition { rule_id: i64, reason: String },

    /// Per-event, per-rule evaluation fault. Isolated to that pair.
    #[error("evaluation failed for rule {rule_id}: {reason}")]
    Evaluation { rule_id: i64, reason: String },

    /// Bus or sink unavailable. Retried with backoff; offsets are held.
    #[error("delivery fault: {0}")]
    Delivery(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Exclusive section was busy; the attempt is skipped, not queued.
    #[error("concurrency: {0}")]
    Concurrency(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Whether this fault means the bus or the store is unavailable. These
    /// surface as degraded health; everything else is absorbed locally.
    pub fn is_delivery_fault(&self) -> bool {
        matches!(self, EngineError::Delivery(_) | EngineError::Storage(_))
    }
}
