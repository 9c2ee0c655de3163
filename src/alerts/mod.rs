//! Alert data model and the deduplication/aggregation stage
//!
//! Module organization:
//! - `types` - severity/status enums, raw and deduplicated alerts, groups
//! - `dedup` - last-write-wins projection by detection identity
//! - `aggregator` - idempotent fold into operator-facing alert groups
//! - `pipeline` - the task wiring alerts through both stages to the store

pub mod aggregator;
pub mod dedup;
pub mod pipeline;
pub mod types;

pub use aggregator::{AlertAggregator, GroupKey};
pub use dedup::AlertDeduplicator;
pub use pipeline::{run_alert_pipeline, AlertPipeline};
pub use types::{
    AggregatedAlertGroup, AlertSource, AlertStatus, DedupKey, DeduplicatedAlert, RawAlert,
    Severity,
};
