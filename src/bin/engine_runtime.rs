//! Engine runtime - wires the full correlation pipeline
//!
//! - Opens the SQLite store and applies the schema
//! - Loads the rule snapshot (fatal if the store is unreachable)
//! - Spawns stream workers (one per bus partition), the alert pipeline,
//!   the batch scheduler, the rule reload task, and the window sweep
//! - Optionally replays a JSONL event file into the bus
//!
//! Usage:
//!   cargo run --release --bin engine_runtime
//!
//! Environment variables: see `EngineConfig::from_env`.

use alertflow::alerts::{
    run_alert_pipeline, AlertAggregator, AlertDeduplicator, AlertPipeline, RawAlert,
};
use alertflow::bus::{EventBus, MemoryBus};
use alertflow::config::EngineConfig;
use alertflow::correlator::{
    run_batch_scheduler, run_stream_worker, BatchCorrelator, EntityWindowTracker,
    StreamCorrelator,
};
use alertflow::events::EventRecord;
use alertflow::ops::EngineMetrics;
use alertflow::rules::{run_rule_reload_task, RuleStore};
use alertflow::store::SqliteStore;
use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let config = EngineConfig::from_env();

    info!("🚀 alertflow engine runtime");
    info!("   ├─ env: {} ({})", config.env, config.instance);
    info!("   └─ db: {}", config.db_path);

    if !config.enabled {
        info!("⚠️  engine is DISABLED (set ALERTFLOW_ENABLED=true to activate)");
        return Ok(());
    }

    // Store and rule snapshot are startup-fatal: refuse to serve rather
    // than run in an undefined state
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let rules = Arc::new(RuleStore::new(store.clone()));
    rules.reload().await?;

    let bus = Arc::new(MemoryBus::new(
        config.partitions,
        Duration::from_millis(config.visibility_timeout_ms),
    ));
    let metrics = Arc::new(EngineMetrics::new());
    let tracker = Arc::new(EntityWindowTracker::new(
        config.max_window_evidence,
        config.window_idle_secs,
    ));
    let correlator = Arc::new(StreamCorrelator::new(
        rules.clone(),
        tracker.clone(),
        metrics.clone(),
        config.max_group_samples,
    ));

    let pipeline = Arc::new(AlertPipeline::new(
        Arc::new(AlertDeduplicator::new()),
        Arc::new(AlertAggregator::new(rules.clone(), config.max_group_samples)),
        store.clone(),
        metrics.clone(),
    ));
    if let Err(e) = pipeline.preload().await {
        error!("❌ dedup warm start failed, continuing cold: {}", e);
    }

    let (alert_tx, alert_rx) = mpsc::channel::<RawAlert>(config.alert_channel_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("🚀 spawning background tasks...");

    // Stream workers, one per partition
    for partition in 0..config.partitions {
        let bus = bus.clone();
        let correlator = correlator.clone();
        let sink = store.clone();
        let alert_tx = alert_tx.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown_rx.clone();
        let batch_size = config.fetch_batch_size;
        let fetch_timeout = Duration::from_millis(config.fetch_timeout_ms);
        tokio::spawn(async move {
            run_stream_worker(
                partition,
                bus,
                correlator,
                sink,
                alert_tx,
                batch_size,
                fetch_timeout,
                metrics,
                shutdown,
            )
            .await;
        });
    }
    info!("   ├─ {} stream workers", config.partitions);

    // Dedup/aggregation pipeline
    {
        let pipeline = pipeline.clone();
        let shutdown = shutdown_rx.clone();
        let flush_interval_ms = config.flush_interval_ms;
        tokio::spawn(async move {
            run_alert_pipeline(pipeline, alert_rx, flush_interval_ms, shutdown).await;
        });
    }
    info!("   ├─ alert pipeline (flush every {}ms)", config.flush_interval_ms);

    // Batch correlator scheduler
    let batch = Arc::new(BatchCorrelator::new(
        rules.clone(),
        store.clone(),
        metrics.clone(),
        Duration::from_secs(config.batch_exec_timeout_secs),
    ));
    {
        let batch = batch.clone();
        let shutdown = shutdown_rx.clone();
        let poll = Duration::from_millis(config.batch_poll_ms);
        tokio::spawn(async move {
            run_batch_scheduler(batch, poll, shutdown).await;
        });
    }
    info!("   ├─ batch scheduler (poll every {}ms)", config.batch_poll_ms);

    // Periodic rule snapshot reload
    {
        let rules = rules.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.rule_reload_secs);
        tokio::spawn(async move {
            run_rule_reload_task(rules, interval, shutdown).await;
        });
    }
    info!("   ├─ rule reload (every {}s)", config.rule_reload_secs);

    // Window idle sweep, retention purge, operational summary
    {
        let tracker = tracker.clone();
        let metrics = metrics.clone();
        let store = store.clone();
        let pipeline = pipeline.clone();
        let retention_secs = config.retention_secs;
        let mut shutdown = shutdown_rx.clone();
        let mut timer =
            tokio::time::interval(Duration::from_secs(config.window_sweep_secs));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let evicted = tracker.sweep();
                        if evicted > 0 {
                            info!("🧹 evicted {} idle entity windows ({} live)", evicted, tracker.len());
                        }

                        let cutoff = chrono::Utc::now().timestamp() - retention_secs;
                        let settled = pipeline.dedup.evict_expired(cutoff)
                            + pipeline.aggregator.evict_expired(cutoff);
                        match store.purge_expired(cutoff) {
                            Ok(purged) if purged > 0 || settled > 0 => {
                                info!("🧹 retention: {} rows purged, {} settled records evicted", purged, settled);
                            }
                            Ok(_) => {}
                            Err(e) => error!("❌ retention purge failed: {}", e),
                        }

                        metrics.log_summary();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
    info!(
        "   └─ window sweep (every {}s, retention {}s)",
        config.window_sweep_secs, config.retention_secs
    );

    // Optional event replay into the bus
    if let Some(path) = config.events_path.clone() {
        let bus = bus.clone();
        let partition_field = config.partition_field.clone();
        tokio::spawn(async move {
            match replay_events(bus, &path, &partition_field).await {
                Ok(count) => info!("✅ replayed {} events from {}", count, path),
                Err(e) => error!("❌ event replay failed ({}): {}", path, e),
            }
        });
    }

    info!("✅ engine running | health: {}", metrics.health().as_str());
    info!("🔄 press CTRL+C to shut down gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  received CTRL+C, shutting down..."),
        Err(err) => error!("❌ failed to listen for CTRL+C: {}", err),
    }

    // Stop intake, let in-flight work finish, final flush happens in the
    // pipeline task
    let _ = shutdown_tx.send(true);
    drop(alert_tx);
    tokio::time::sleep(Duration::from_secs(2)).await;

    metrics.log_summary();
    info!("✅ engine runtime stopped");
    Ok(())
}

/// Replay a JSONL file of events into the bus, partitioned by the
/// configured field. Malformed lines are skipped with a logged reason.
async fn replay_events(
    bus: Arc<MemoryBus>,
    path: &str,
    partition_field: &str,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let content = tokio::fs::read_to_string(path).await?;
    let now = chrono::Utc::now().timestamp();
    let mut count = 0;

    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("skipping malformed event at line {}: {}", lineno + 1, e);
                continue;
            }
        };
        let Some(event) = EventRecord::from_json(&value, now) else {
            log::warn!("skipping non-object event at line {}", lineno + 1);
            continue;
        };
        let key = event.field(partition_field).unwrap_or("").to_string();
        bus.publish(&key, event).await?;
        count += 1;
    }
    Ok(count)
}
