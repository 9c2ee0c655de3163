//! Normalized event records consumed by the stream correlator
//!
//! Events arrive from the upstream filter stage as flat string-valued field
//! maps plus an event timestamp. Field names may contain dots; they are
//! plain keys, not paths.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single normalized, filtered security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event timestamp (unix seconds). Windowing is driven by this, not by
    /// arrival time, so bounded out-of-order delivery is tolerated.
    pub ts: i64,

    /// Flat field map (e.g. "source_ip", "user", "event.category").
    pub fields: HashMap<String, String>,
}

impl EventRecord {
    pub fn new(ts: i64) -> Self {
        Self {
            ts,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    /// Field lookup. Missing fields read as None; the predicate DSL maps
    /// that to "no match" rather than an error.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }

    /// Build an event from a loose JSON object, coercing scalar values to
    /// strings. `ts` is taken from a numeric "ts" member when present,
    /// otherwise from `fallback_ts`.
    pub fn from_json(value: &serde_json::Value, fallback_ts: i64) -> Option<Self> {
        let obj = value.as_object()?;
        let ts = obj
            .get("ts")
            .and_then(|v| v.as_i64())
            .unwrap_or(fallback_ts);

        let mut fields = HashMap::new();
        for (key, val) in obj {
            if key == "ts" {
                continue;
            }
            let s = match val {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            fields.insert(key.clone(), s);
        }

        Some(Self { ts, fields })
    }

    /// JSON object view of the fields, used for evidence samples.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("ts".to_string(), serde_json::json!(self.ts));
        for (k, v) in &self.fields {
            obj.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        serde_json::Value::Object(obj)
    }
}
