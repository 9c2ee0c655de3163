//! SQLite persistence for rules, alerts, and aggregates
//!
//! The store is the single source of truth for alert state. All write paths
//! are append (alerts_raw) or replace-by-key (alerts_dedup, alerts_agg);
//! the engine never does read-modify-write round trips on the hot path.
//!
//! Tables:
//! - `stream_rules` / `batch_rules` - operator-defined correlation rules
//! - `alerts_raw` - append-only alerts from both correlators
//! - `alerts_dedup` - replace-by-key projection keyed by the dedup identity
//! - `alerts_agg` - upsert by (rule_id, group_key), versioned by updated_at

use crate::alerts::types::{
    AggregatedAlertGroup, AlertSource, AlertStatus, DeduplicatedAlert, RawAlert, Severity,
};
use crate::error::EngineError;
use crate::rules::{BatchRule, StreamRule};
use async_trait::async_trait;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Idempotent schema. Every statement uses IF NOT EXISTS so startup can run
/// it unconditionally.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stream_rules (
    id           INTEGER PRIMARY KEY,
    name         TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    enabled      INTEGER NOT NULL DEFAULT 1,
    kind         TEXT NOT NULL DEFAULT 'threshold',
    severity     TEXT NOT NULL DEFAULT 'low',
    entity_field TEXT NOT NULL,
    expr         TEXT NOT NULL DEFAULT '',
    window_s     INTEGER NOT NULL,
    threshold    INTEGER NOT NULL,
    cooldown_s   INTEGER NOT NULL DEFAULT 0,
    group_by     TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS batch_rules (
    id           INTEGER PRIMARY KEY,
    name         TEXT NOT NULL,
    enabled      INTEGER NOT NULL DEFAULT 1,
    interval_s   INTEGER NOT NULL,
    lookback_s   INTEGER NOT NULL,
    sql_template TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts_raw (
    ts           INTEGER NOT NULL,
    alert_id     TEXT NOT NULL,
    rule_id      INTEGER NOT NULL,
    rule_name    TEXT NOT NULL,
    severity     TEXT NOT NULL,
    ts_first     INTEGER NOT NULL,
    ts_last      INTEGER NOT NULL,
    window_s     INTEGER NOT NULL,
    entity_key   TEXT NOT NULL,
    hits         INTEGER NOT NULL,
    context_json TEXT NOT NULL DEFAULT '{}',
    source       TEXT NOT NULL DEFAULT 'stream',
    status       TEXT NOT NULL DEFAULT 'open'
);

CREATE INDEX IF NOT EXISTS idx_alerts_raw_rule_ts
    ON alerts_raw (rule_id, ts_last);

CREATE TABLE IF NOT EXISTS alerts_dedup (
    rule_id      INTEGER NOT NULL,
    entity_key   TEXT NOT NULL,
    ts_first     INTEGER NOT NULL,
    ts_last      INTEGER NOT NULL,
    alert_id     TEXT NOT NULL,
    rule_name    TEXT NOT NULL,
    severity     TEXT NOT NULL,
    window_s     INTEGER NOT NULL,
    hits         INTEGER NOT NULL,
    context_json TEXT NOT NULL DEFAULT '{}',
    source       TEXT NOT NULL DEFAULT 'stream',
    status       TEXT NOT NULL DEFAULT 'open',
    updated_at   INTEGER NOT NULL,
    PRIMARY KEY (rule_id, entity_key, ts_first, ts_last)
);

CREATE TABLE IF NOT EXISTS alerts_agg (
    rule_id         INTEGER NOT NULL,
    group_key       TEXT NOT NULL,
    agg_id          TEXT NOT NULL,
    rule_name       TEXT NOT NULL,
    severity_agg    TEXT NOT NULL,
    ts_first        INTEGER NOT NULL,
    ts_last         INTEGER NOT NULL,
    count_alerts    INTEGER NOT NULL,
    unique_entities INTEGER NOT NULL,
    samples_json    TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL DEFAULT 'open',
    updated_at      INTEGER NOT NULL,
    PRIMARY KEY (rule_id, group_key)
);
"#;

/// Read side of the rule tables. Seam for the RuleStore.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Enabled stream rules, predicates not yet compiled.
    async fn load_stream_rules(&self) -> Result<Vec<StreamRule>, EngineError>;

    /// Enabled batch rules.
    async fn load_batch_rules(&self) -> Result<Vec<BatchRule>, EngineError>;
}

/// Write side for alerts and aggregates, plus batch template execution.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Append raw alerts. Append-only; redelivery duplicates are collapsed
    /// downstream by the deduplicator.
    async fn append_raw(&self, alerts: &[RawAlert]) -> Result<(), EngineError>;

    /// Replace-by-key write of the deduplicated projection.
    async fn replace_dedup(&self, alerts: &[DeduplicatedAlert]) -> Result<(), EngineError>;

    /// Upsert aggregated groups keyed by (rule_id, group_key).
    async fn upsert_groups(&self, groups: &[AggregatedAlertGroup]) -> Result<(), EngineError>;

    /// Execute one batch rule statement (window already substituted).
    /// Returns rows affected.
    async fn execute_template(&self, sql: &str) -> Result<usize, EngineError>;

    /// Raw alerts appended past the given rowid, for feeding the
    /// dedup/aggregation pipeline. Returns the alerts and the new cursor.
    /// This is the authoritative path into the projection: alerts that
    /// also arrived over the worker channel re-absorb idempotently.
    async fn load_alerts_after(
        &self,
        after_rowid: i64,
    ) -> Result<(Vec<RawAlert>, i64), EngineError>;

    /// Deduplicated state for warm start after a restart.
    async fn load_dedup_state(&self) -> Result<Vec<DeduplicatedAlert>, EngineError>;
}

/// SQLite-backed store behind a single shared connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database, switch to WAL, and apply the schema.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a stream rule definition. Operator tooling and
    /// tests; the engine itself never writes rules.
    pub fn upsert_stream_rule(&self, rule: &StreamRule) -> Result<(), EngineError> {
        let group_by = if rule.group_by.is_empty() {
            String::new()
        } else {
            serde_json::Value::from(rule.group_by.clone()).to_string()
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO stream_rules
                (id, name, description, enabled, kind, severity, entity_field,
                 expr, window_s, threshold, cooldown_s, group_by)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            rusqlite::params![
                rule.id,
                rule.name,
                rule.description,
                rule.enabled as i64,
                rule.kind,
                rule.severity.as_str(),
                rule.entity_field,
                rule.expr_text,
                rule.window_s,
                rule.threshold,
                rule.cooldown_s,
                group_by,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_batch_rule(&self, rule: &BatchRule) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO batch_rules
                (id, name, enabled, interval_s, lookback_s, sql_template)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                rule.id,
                rule.name,
                rule.enabled as i64,
                rule.interval_s,
                rule.lookback_s,
                rule.sql_template,
            ],
        )?;
        Ok(())
    }

    /// Drop alert rows past their retention period. Raw alerts age out by
    /// event time; the dedup projection and aggregated groups age out by
    /// their last update, so a group stays as long as it keeps changing.
    /// Returns the number of rows purged.
    pub fn purge_expired(&self, cutoff: i64) -> Result<usize, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut purged = conn.execute("DELETE FROM alerts_raw WHERE ts < ?1", [cutoff])?;
        purged += conn.execute("DELETE FROM alerts_dedup WHERE updated_at < ?1", [cutoff])?;
        purged += conn.execute("DELETE FROM alerts_agg WHERE updated_at < ?1", [cutoff])?;
        Ok(purged)
    }

    pub fn count_raw_alerts(&self) -> Result<u64, EngineError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT count(*) FROM alerts_raw", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn load_groups(&self) -> Result<Vec<AggregatedAlertGroup>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT agg_id, rule_id, rule_name, group_key, severity_agg,
                   ts_first, ts_last, count_alerts, unique_entities,
                   samples_json, status, updated_at
            FROM alerts_agg
            ORDER BY rule_id, group_key
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let severity: String = row.get(4)?;
            let count_alerts: i64 = row.get(7)?;
            let unique_entities: i64 = row.get(8)?;
            let samples_json: String = row.get(9)?;
            let status: String = row.get(10)?;
            Ok(AggregatedAlertGroup {
                agg_id: row.get(0)?,
                rule_id: row.get(1)?,
                rule_name: row.get(2)?,
                group_key: row.get(3)?,
                severity_agg: Severity::from_str(&severity),
                ts_first: row.get(5)?,
                ts_last: row.get(6)?,
                count_alerts: count_alerts as u64,
                unique_entities: unique_entities as u64,
                samples: serde_json::from_str(&samples_json).unwrap_or_default(),
                status: AlertStatus::from_str(&status),
                updated_at: row.get(11)?,
            })
        })?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }
}

fn raw_alert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAlert> {
    let severity: String = row.get(4)?;
    let context_json: String = row.get(10)?;
    let source: String = row.get(11)?;
    let status: String = row.get(12)?;
    Ok(RawAlert {
        ts: row.get(0)?,
        alert_id: row.get(1)?,
        rule_id: row.get(2)?,
        rule_name: row.get(3)?,
        severity: Severity::from_str(&severity),
        ts_first: row.get(5)?,
        ts_last: row.get(6)?,
        window_s: row.get(7)?,
        entity_key: row.get(8)?,
        hits: row.get(9)?,
        context: serde_json::from_str(&context_json).unwrap_or(serde_json::Value::Null),
        source: AlertSource::from_str(&source),
        status: AlertStatus::from_str(&status),
    })
}

#[async_trait]
impl RuleSource for SqliteStore {
    async fn load_stream_rules(&self) -> Result<Vec<StreamRule>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, description, enabled, kind, severity, entity_field,
                   expr, window_s, threshold, cooldown_s, group_by
            FROM stream_rules
            WHERE enabled = 1
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let enabled: i64 = row.get(3)?;
            let severity: String = row.get(5)?;
            let group_by: String = row.get(11)?;
            Ok(StreamRule {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                enabled: enabled != 0,
                kind: row.get(4)?,
                severity: Severity::from_str(&severity),
                entity_field: row.get(6)?,
                expr_text: row.get(7)?,
                expr: None,
                window_s: row.get(8)?,
                threshold: row.get(9)?,
                cooldown_s: row.get(10)?,
                group_by: parse_group_by(&group_by),
            })
        })?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    async fn load_batch_rules(&self) -> Result<Vec<BatchRule>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, enabled, interval_s, lookback_s, sql_template
            FROM batch_rules
            WHERE enabled = 1
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let enabled: i64 = row.get(2)?;
            Ok(BatchRule {
                id: row.get(0)?,
                name: row.get(1)?,
                enabled: enabled != 0,
                interval_s: row.get(3)?,
                lookback_s: row.get(4)?,
                sql_template: row.get(5)?,
            })
        })?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }
}

fn parse_group_by(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(fields) => fields,
        Err(e) => {
            log::warn!("ignoring malformed group_by {:?}: {}", raw, e);
            Vec::new()
        }
    }
}

#[async_trait]
impl AlertSink for SqliteStore {
    async fn append_raw(&self, alerts: &[RawAlert]) -> Result<(), EngineError> {
        if alerts.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for alert in alerts {
            tx.execute(
                r#"
                INSERT INTO alerts_raw
                    (ts, alert_id, rule_id, rule_name, severity, ts_first,
                     ts_last, window_s, entity_key, hits, context_json,
                     source, status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                rusqlite::params![
                    alert.ts,
                    alert.alert_id,
                    alert.rule_id,
                    alert.rule_name,
                    alert.severity.as_str(),
                    alert.ts_first,
                    alert.ts_last,
                    alert.window_s,
                    alert.entity_key,
                    alert.hits,
                    alert.context.to_string(),
                    alert.source.as_str(),
                    alert.status.as_str(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn replace_dedup(&self, alerts: &[DeduplicatedAlert]) -> Result<(), EngineError> {
        if alerts.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for alert in alerts {
            tx.execute(
                r#"
                INSERT INTO alerts_dedup
                    (rule_id, entity_key, ts_first, ts_last, alert_id,
                     rule_name, severity, window_s, hits, context_json,
                     source, status, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(rule_id, entity_key, ts_first, ts_last) DO UPDATE SET
                    alert_id = excluded.alert_id,
                    rule_name = excluded.rule_name,
                    severity = excluded.severity,
                    window_s = excluded.window_s,
                    hits = excluded.hits,
                    context_json = excluded.context_json,
                    source = excluded.source,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                "#,
                rusqlite::params![
                    alert.rule_id,
                    alert.entity_key,
                    alert.ts_first,
                    alert.ts_last,
                    alert.alert_id,
                    alert.rule_name,
                    alert.severity.as_str(),
                    alert.window_s,
                    alert.hits,
                    alert.context.to_string(),
                    alert.source.as_str(),
                    alert.status.as_str(),
                    alert.updated_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn upsert_groups(&self, groups: &[AggregatedAlertGroup]) -> Result<(), EngineError> {
        if groups.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for group in groups {
            let samples = serde_json::Value::from(group.samples.clone()).to_string();
            tx.execute(
                r#"
                INSERT INTO alerts_agg
                    (rule_id, group_key, agg_id, rule_name, severity_agg,
                     ts_first, ts_last, count_alerts, unique_entities,
                     samples_json, status, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(rule_id, group_key) DO UPDATE SET
                    agg_id = excluded.agg_id,
                    rule_name = excluded.rule_name,
                    severity_agg = excluded.severity_agg,
                    ts_first = excluded.ts_first,
                    ts_last = excluded.ts_last,
                    count_alerts = excluded.count_alerts,
                    unique_entities = excluded.unique_entities,
                    samples_json = excluded.samples_json,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                "#,
                rusqlite::params![
                    group.rule_id,
                    group.group_key,
                    group.agg_id,
                    group.rule_name,
                    group.severity_agg.as_str(),
                    group.ts_first,
                    group.ts_last,
                    group.count_alerts as i64,
                    group.unique_entities as i64,
                    samples,
                    group.status.as_str(),
                    group.updated_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn execute_template(&self, sql: &str) -> Result<usize, EngineError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(sql, [])?;
        Ok(rows)
    }

    async fn load_alerts_after(
        &self,
        after_rowid: i64,
    ) -> Result<(Vec<RawAlert>, i64), EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT ts, alert_id, rule_id, rule_name, severity, ts_first,
                   ts_last, window_s, entity_key, hits, context_json,
                   source, status, rowid
            FROM alerts_raw
            WHERE rowid > ?1
            ORDER BY rowid
            "#,
        )?;

        let rows = stmt.query_map([after_rowid], |row| {
            let alert = raw_alert_from_row(row)?;
            let rowid: i64 = row.get(13)?;
            Ok((alert, rowid))
        })?;

        let mut alerts = Vec::new();
        let mut cursor = after_rowid;
        for row in rows {
            let (alert, rowid) = row?;
            cursor = cursor.max(rowid);
            alerts.push(alert);
        }
        Ok((alerts, cursor))
    }

    async fn load_dedup_state(&self) -> Result<Vec<DeduplicatedAlert>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT rule_id, entity_key, ts_first, ts_last, alert_id,
                   rule_name, severity, window_s, hits, context_json,
                   source, status, updated_at
            FROM alerts_dedup
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let severity: String = row.get(6)?;
            let context_json: String = row.get(9)?;
            let source: String = row.get(10)?;
            let status: String = row.get(11)?;
            Ok(DeduplicatedAlert {
                rule_id: row.get(0)?,
                entity_key: row.get(1)?,
                ts_first: row.get(2)?,
                ts_last: row.get(3)?,
                alert_id: row.get(4)?,
                rule_name: row.get(5)?,
                severity: Severity::from_str(&severity),
                window_s: row.get(7)?,
                hits: row.get(8)?,
                context: serde_json::from_str(&context_json)
                    .unwrap_or(serde_json::Value::Null),
                source: AlertSource::from_str(&source),
                status: AlertStatus::from_str(&status),
                updated_at: row.get(12)?,
            })
        })?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }
}
