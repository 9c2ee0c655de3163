//! Alert data model shared by the correlators, deduplicator, and aggregator

use serde::{Deserialize, Serialize};

/// Alert severity under a total order: low < medium < high < critical.
/// Aggregate severity is the max over group members.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Unknown labels fold to low rather than failing the row.
    pub fn from_str(s: &str) -> Self {
        match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

/// Alert lifecycle status. Only "open" keeps a group open.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Ack,
    Closed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Ack => "ack",
            AlertStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ack" => AlertStatus::Ack,
            "closed" => AlertStatus::Closed,
            _ => AlertStatus::Open,
        }
    }
}

/// Which subsystem raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    Stream,
    Batch,
}

impl AlertSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSource::Stream => "stream",
            AlertSource::Batch => "batch",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "batch" => AlertSource::Batch,
            _ => AlertSource::Stream,
        }
    }
}

/// An alert as produced by either correlator. Append-only in the store;
/// the alert id is regenerated per physical write and is deliberately not
/// part of the deduplication identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAlert {
    pub ts: i64,
    pub alert_id: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub severity: Severity,
    pub ts_first: i64,
    pub ts_last: i64,
    pub window_s: i64,
    pub entity_key: String,
    pub hits: u32,
    pub context: serde_json::Value,
    pub source: AlertSource,
    pub status: AlertStatus,
}

impl RawAlert {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            rule_id: self.rule_id,
            entity_key: self.entity_key.clone(),
            ts_first: self.ts_first,
            ts_last: self.ts_last,
        }
    }
}

/// Identity of a logical detection. Two raw alerts with the same key are
/// the same detection regardless of how many times they were written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub rule_id: i64,
    pub entity_key: String,
    pub ts_first: i64,
    pub ts_last: i64,
}

impl DedupKey {
    /// Stable string form, used as a member id inside aggregated groups.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.rule_id, self.entity_key, self.ts_first, self.ts_last
        )
    }
}

/// Latest-wins projection of a raw alert onto its dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicatedAlert {
    pub rule_id: i64,
    pub entity_key: String,
    pub ts_first: i64,
    pub ts_last: i64,
    pub alert_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub window_s: i64,
    pub hits: u32,
    pub context: serde_json::Value,
    pub source: AlertSource,
    pub status: AlertStatus,
    pub updated_at: i64,
}

impl DeduplicatedAlert {
    pub fn key(&self) -> DedupKey {
        DedupKey {
            rule_id: self.rule_id,
            entity_key: self.entity_key.clone(),
            ts_first: self.ts_first,
            ts_last: self.ts_last,
        }
    }

    pub fn from_raw(alert: &RawAlert, updated_at: i64) -> Self {
        Self {
            rule_id: alert.rule_id,
            entity_key: alert.entity_key.clone(),
            ts_first: alert.ts_first,
            ts_last: alert.ts_last,
            alert_id: alert.alert_id.clone(),
            rule_name: alert.rule_name.clone(),
            severity: alert.severity,
            window_s: alert.window_s,
            hits: alert.hits,
            context: alert.context.clone(),
            source: alert.source,
            status: alert.status,
            updated_at,
        }
    }
}

/// One operator-facing alert group: the fold of all deduplicated alerts
/// that share (rule id, grouping key). Superseded by newer versions via
/// `updated_at`, never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedAlertGroup {
    pub agg_id: String,
    pub rule_id: i64,
    pub rule_name: String,
    /// Deterministic serialization of the grouping key fields.
    pub group_key: String,
    pub severity_agg: Severity,
    pub ts_first: i64,
    pub ts_last: i64,
    pub count_alerts: u64,
    pub unique_entities: u64,
    pub samples: Vec<serde_json::Value>,
    pub status: AlertStatus,
    pub updated_at: i64,
}
