//! Alert aggregation: idempotent fold of deduplicated alerts into groups
//!
//! Groups are keyed by (rule id, serialized grouping key). The grouping
//! fields come from the rule definition when present, else the default
//! (rule id, entity key). Serialization goes through a sorted map so equal
//! logical groupings always compare equal regardless of insertion order.
//!
//! The fold is commutative and idempotent: members are tracked by their
//! dedup key, so re-absorbing the same alert replaces its contribution
//! instead of double-counting.

use crate::alerts::types::{
    AggregatedAlertGroup, AlertStatus, DeduplicatedAlert, Severity,
};
use crate::rules::RuleStore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub rule_id: i64,
    pub key: String,
}

struct GroupState {
    agg_id: String,
    rule_name: String,
    ts_first: i64,
    ts_last: i64,
    /// Member contributions by dedup key: status and severity of the
    /// latest absorbed version of each member.
    members: HashMap<String, (AlertStatus, Severity)>,
    entities: HashSet<String>,
    samples: Vec<serde_json::Value>,
    sampled_members: HashSet<String>,
    dirty: bool,
    /// `updated_at` of the last flushed version, for retention eviction.
    settled_at: i64,
}

pub struct AlertAggregator {
    rules: Arc<RuleStore>,
    groups: Mutex<HashMap<GroupKey, GroupState>>,
    max_samples: usize,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl AlertAggregator {
    pub fn new(rules: Arc<RuleStore>, max_samples: usize) -> Self {
        Self::new_with_timestamp_fn(
            rules,
            max_samples,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    pub fn new_with_timestamp_fn(
        rules: Arc<RuleStore>,
        max_samples: usize,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            rules,
            groups: Mutex::new(HashMap::new()),
            max_samples,
            now_fn,
        }
    }

    /// Grouping key for an alert. The rule-specified field list is
    /// authoritative; (rule id, entity key) is the fallback when the rule
    /// specifies none or is unknown (e.g. batch meta-alerts).
    pub fn group_key_for(&self, alert: &DeduplicatedAlert) -> GroupKey {
        let group_by = self
            .rules
            .stream_rule(alert.rule_id)
            .map(|r| r.group_by)
            .unwrap_or_default();

        let mut fields = BTreeMap::new();
        if group_by.is_empty() {
            fields.insert("rule_id".to_string(), alert.rule_id.to_string());
            fields.insert("entity_key".to_string(), alert.entity_key.clone());
        } else {
            for name in &group_by {
                fields.insert(name.clone(), resolve_group_field(alert, name));
            }
        }

        GroupKey {
            rule_id: alert.rule_id,
            // BTreeMap serializes in sorted key order
            key: serde_json::Value::from(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect::<serde_json::Map<String, serde_json::Value>>(),
            )
            .to_string(),
        }
    }

    /// Fold one deduplicated alert into its group.
    pub fn absorb(&self, alert: &DeduplicatedAlert) {
        let key = self.group_key_for(alert);
        let member_id = alert.key().to_string_key();
        let mut groups = self.groups.lock().unwrap();

        let group = groups.entry(key).or_insert_with(|| GroupState {
            agg_id: uuid::Uuid::new_v4().to_string(),
            rule_name: alert.rule_name.clone(),
            ts_first: alert.ts_first,
            ts_last: alert.ts_last,
            members: HashMap::new(),
            entities: HashSet::new(),
            samples: Vec::new(),
            sampled_members: HashSet::new(),
            dirty: false,
            settled_at: 0,
        });

        group.ts_first = group.ts_first.min(alert.ts_first);
        group.ts_last = group.ts_last.max(alert.ts_last);
        group
            .members
            .insert(member_id.clone(), (alert.status, alert.severity));
        group.entities.insert(alert.entity_key.clone());

        // Evidence is capped and deterministic: the first few members seen,
        // one sample each
        if group.samples.len() < self.max_samples && !group.sampled_members.contains(&member_id)
        {
            group.samples.push(alert.context.clone());
            group.sampled_members.insert(member_id);
        }

        group.dirty = true;
    }

    /// Groups changed since the last drain, rendered for the upsert flush.
    pub fn drain_dirty(&self) -> Vec<AggregatedAlertGroup> {
        let now = (self.now_fn)();
        let mut groups = self.groups.lock().unwrap();
        let mut out = Vec::new();

        for (key, group) in groups.iter_mut() {
            if !group.dirty {
                continue;
            }
            group.dirty = false;
            group.settled_at = now;

            let severity_agg = group
                .members
                .values()
                .map(|(_, severity)| *severity)
                .max()
                .unwrap_or(Severity::Low);
            let status = if group
                .members
                .values()
                .any(|(status, _)| *status == AlertStatus::Open)
            {
                AlertStatus::Open
            } else {
                AlertStatus::Closed
            };

            out.push(AggregatedAlertGroup {
                agg_id: group.agg_id.clone(),
                rule_id: key.rule_id,
                rule_name: group.rule_name.clone(),
                group_key: key.key.clone(),
                severity_agg,
                ts_first: group.ts_first,
                ts_last: group.ts_last,
                count_alerts: group.members.len() as u64,
                unique_entities: group.entities.len() as u64,
                samples: group.samples.clone(),
                status,
                updated_at: now,
            });
        }
        out
    }

    /// Re-mark groups dirty after a failed flush so the next tick retries.
    pub fn restore_dirty(&self, flushed: &[AggregatedAlertGroup]) {
        let mut groups = self.groups.lock().unwrap();
        for g in flushed {
            let key = GroupKey {
                rule_id: g.rule_id,
                key: g.group_key.clone(),
            };
            if let Some(state) = groups.get_mut(&key) {
                state.dirty = true;
            }
        }
    }

    /// Drop settled groups whose last flushed version is older than
    /// `cutoff`. Dirty groups stay until they flush; the persisted rows are
    /// purged separately on the same retention schedule.
    pub fn evict_expired(&self, cutoff: i64) -> usize {
        let mut groups = self.groups.lock().unwrap();
        let before = groups.len();
        groups.retain(|_, g| g.dirty || g.settled_at >= cutoff);
        before - groups.len()
    }

    pub fn len(&self) -> usize {
        self.groups.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn resolve_group_field(alert: &DeduplicatedAlert, name: &str) -> String {
    match name {
        "rule_id" => alert.rule_id.to_string(),
        "rule_name" => alert.rule_name.clone(),
        "entity_key" => alert.entity_key.clone(),
        "severity" => alert.severity.as_str().to_string(),
        "source" => alert.source.as_str().to_string(),
        other => alert
            .context
            .get(other)
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                v => v.to_string(),
            })
            .unwrap_or_default(),
    }
}
