//! End-to-end engine tests: events through the bus, stream workers, batch
//! correlation, and the dedup/aggregation pipeline into SQLite.

use alertflow::alerts::{
    run_alert_pipeline, AlertAggregator, AlertDeduplicator, AlertPipeline, RawAlert,
};
use alertflow::bus::{EventBus, MemoryBus};
use alertflow::correlator::{
    run_batch_scheduler, run_stream_worker, BatchCorrelator, EntityWindowTracker,
    StreamCorrelator,
};
use alertflow::events::EventRecord;
use alertflow::ops::EngineMetrics;
use alertflow::rules::{BatchRule, RuleStore, StreamRule, KIND_THRESHOLD};
use alertflow::store::{AlertSink, SqliteStore};
use alertflow::Severity;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, watch};

fn brute_force_rule() -> StreamRule {
    StreamRule {
        id: 1,
        name: "ssh brute force".to_string(),
        description: "repeated failed logins from one source".to_string(),
        enabled: true,
        kind: KIND_THRESHOLD.to_string(),
        severity: Severity::High,
        entity_field: "source_ip".to_string(),
        expr_text: "event.category == 'auth_fail'".to_string(),
        expr: None,
        window_s: 30,
        threshold: 5,
        cooldown_s: 0,
        group_by: Vec::new(),
    }
}

fn repeat_offender_rule(interval_s: i64) -> BatchRule {
    BatchRule {
        id: 100,
        name: "repeat offender".to_string(),
        enabled: true,
        interval_s,
        lookback_s: 300,
        sql_template: "INSERT INTO alerts_raw \
            (ts, alert_id, rule_id, rule_name, severity, ts_first, ts_last, \
             window_s, entity_key, hits, context_json, source, status) \
            SELECT max(ts_last), lower(hex(randomblob(16))), 100, 'repeat offender', \
                   'critical', min(ts_first), max(ts_last), {WINDOW_S}, entity_key, \
                   count(*), '{}', 'batch', 'open' \
            FROM alerts_raw WHERE rule_id = 1 AND source = 'stream' \
            GROUP BY entity_key HAVING count(*) >= 1"
            .to_string(),
    }
}

fn auth_fail(ts: i64, ip: &str) -> EventRecord {
    EventRecord::new(ts)
        .with_field("source_ip", ip)
        .with_field("event.category", "auth_fail")
}

struct Engine {
    _db_file: NamedTempFile,
    store: Arc<SqliteStore>,
    rules: Arc<RuleStore>,
    bus: Arc<MemoryBus>,
    metrics: Arc<EngineMetrics>,
    shutdown_tx: watch::Sender<bool>,
    alert_tx: mpsc::Sender<RawAlert>,
}

/// Build and start a two-partition engine over a temp database.
async fn start_engine() -> Engine {
    let db_file = NamedTempFile::new().unwrap();
    let store = Arc::new(SqliteStore::open(db_file.path().to_str().unwrap()).unwrap());
    store.upsert_stream_rule(&brute_force_rule()).unwrap();

    let rules = Arc::new(RuleStore::new(store.clone()));
    rules.reload().await.unwrap();

    let bus = Arc::new(MemoryBus::new(2, Duration::from_secs(30)));
    let metrics = Arc::new(EngineMetrics::new());
    let tracker = Arc::new(EntityWindowTracker::new(5, 900));
    let correlator = Arc::new(StreamCorrelator::new(
        rules.clone(),
        tracker,
        metrics.clone(),
        3,
    ));

    let pipeline = Arc::new(AlertPipeline::new(
        Arc::new(AlertDeduplicator::new()),
        Arc::new(AlertAggregator::new(rules.clone(), 3)),
        store.clone(),
        metrics.clone(),
    ));

    let (alert_tx, alert_rx) = mpsc::channel(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for partition in 0..bus.partitions() {
        tokio::spawn(run_stream_worker(
            partition,
            bus.clone(),
            correlator.clone(),
            store.clone(),
            alert_tx.clone(),
            100,
            Duration::from_millis(50),
            metrics.clone(),
            shutdown_rx.clone(),
        ));
    }

    tokio::spawn(run_alert_pipeline(
        pipeline,
        alert_rx,
        100,
        shutdown_rx.clone(),
    ));

    Engine {
        _db_file: db_file,
        store,
        rules,
        bus,
        metrics,
        shutdown_tx,
        alert_tx,
    }
}

#[tokio::test]
async fn test_stream_detection_end_to_end() {
    let engine = start_engine().await;

    // Five failing logins inside the 30s window, plus noise
    for (i, ts) in [0i64, 5, 10, 20, 29].iter().enumerate() {
        engine
            .bus
            .publish("10.0.0.1", auth_fail(*ts, "10.0.0.1"))
            .await
            .unwrap();
        engine
            .bus
            .publish(
                "10.0.0.9",
                EventRecord::new(*ts + i as i64).with_field("event.category", "login_ok"),
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(600)).await;

    // The alert is durable and acknowledged
    assert!(engine.store.count_raw_alerts().unwrap() >= 1);
    assert_eq!(engine.bus.pending_len(), 0);

    // Deduplicated into one detection, aggregated into one open group
    let dedup = engine.store.load_dedup_state().await.unwrap();
    assert_eq!(dedup.len(), 1);
    assert_eq!(dedup[0].hits, 5);
    assert_eq!(dedup[0].ts_first, 0);
    assert_eq!(dedup[0].ts_last, 29);

    let groups = engine.store.load_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].rule_id, 1);
    assert_eq!(groups[0].count_alerts, 1);
    assert_eq!(groups[0].status.as_str(), "open");
    assert_eq!(groups[0].severity_agg, Severity::High);

    assert_eq!(engine.metrics.events_processed(), 10);
    let _ = engine.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_batch_meta_alert_flows_into_groups() {
    let engine = start_engine().await;
    engine
        .store
        .upsert_batch_rule(&repeat_offender_rule(1))
        .unwrap();
    engine.rules.reload().await.unwrap();

    // Raise the underlying stream detection first
    for ts in [0i64, 5, 10, 20, 29] {
        engine
            .bus
            .publish("10.0.0.1", auth_fail(ts, "10.0.0.1"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Start the batch scheduler; its first due tick fires immediately
    let batch = Arc::new(BatchCorrelator::new(
        engine.rules.clone(),
        engine.store.clone(),
        engine.metrics.clone(),
        Duration::from_secs(5),
    ));
    let (batch_shutdown_tx, batch_shutdown_rx) = watch::channel(false);
    tokio::spawn(run_batch_scheduler(
        batch,
        Duration::from_millis(50),
        batch_shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(600)).await;

    // The meta-alert exists and was folded into its own group
    let exec = engine.metrics.batch_execution(100).unwrap();
    assert!(exec.runs >= 1);
    assert!(exec.last_rows >= 1);

    let groups = engine.store.load_groups().unwrap();
    let meta_group = groups.iter().find(|g| g.rule_id == 100).unwrap();
    assert_eq!(meta_group.severity_agg, Severity::Critical);
    assert!(groups.iter().any(|g| g.rule_id == 1));

    let _ = batch_shutdown_tx.send(true);
    let _ = engine.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_graceful_shutdown_flushes_buffered_state() {
    let engine = start_engine().await;

    // Raise a detection but shut down before the next flush tick would
    // plausibly run everything
    for ts in [0i64, 5, 10, 20, 29] {
        engine
            .bus
            .publish("10.0.0.1", auth_fail(ts, "10.0.0.1"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let _ = engine.shutdown_tx.send(true);
    drop(engine.alert_tx);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Final flush persisted the projection and the groups
    assert_eq!(engine.store.load_dedup_state().await.unwrap().len(), 1);
    assert_eq!(engine.store.load_groups().unwrap().len(), 1);
}

#[tokio::test]
async fn test_restart_with_preload_stays_idempotent() {
    let db_file = NamedTempFile::new().unwrap();
    let path = db_file.path().to_str().unwrap().to_string();

    let detection = RawAlert {
        ts: 29,
        alert_id: "first-write".to_string(),
        rule_id: 1,
        rule_name: "ssh brute force".to_string(),
        severity: Severity::High,
        ts_first: 0,
        ts_last: 29,
        window_s: 30,
        entity_key: "10.0.0.1".to_string(),
        hits: 5,
        context: serde_json::json!({"entity_key": "10.0.0.1"}),
        source: alertflow::AlertSource::Stream,
        status: alertflow::AlertStatus::Open,
    };

    // First life: absorb and flush
    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let rules = Arc::new(RuleStore::new(store.clone()));
        rules.reload().await.unwrap();
        let pipeline = AlertPipeline::new(
            Arc::new(AlertDeduplicator::new()),
            Arc::new(AlertAggregator::new(rules, 3)),
            store.clone(),
            Arc::new(EngineMetrics::new()),
        );
        pipeline.absorb(&detection);
        pipeline.flush().await;
    }

    // Second life: preload, then redeliver the same detection
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let rules = Arc::new(RuleStore::new(store.clone()));
    rules.reload().await.unwrap();
    let pipeline = AlertPipeline::new(
        Arc::new(AlertDeduplicator::new()),
        Arc::new(AlertAggregator::new(rules, 3)),
        store.clone(),
        Arc::new(EngineMetrics::new()),
    );
    pipeline.preload().await.unwrap();

    let mut redelivered = detection.clone();
    redelivered.alert_id = "second-write".to_string();
    pipeline.absorb(&redelivered);
    pipeline.flush().await;

    let dedup = store.load_dedup_state().await.unwrap();
    assert_eq!(dedup.len(), 1);
    assert_eq!(dedup[0].alert_id, "second-write");

    let groups = store.load_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].count_alerts, 1);
    assert_eq!(groups[0].unique_entities, 1);
}
