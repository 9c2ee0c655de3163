//! One-shot batch correlation pass
//!
//! Runs every enabled batch rule exactly once and reports the outcome.
//! Meant for cron-style deployments and for debugging rule templates
//! without starting the full runtime.
//!
//! Usage:
//!   cargo run --release --bin batch_once

use alertflow::config::EngineConfig;
use alertflow::correlator::BatchCorrelator;
use alertflow::ops::EngineMetrics;
use alertflow::rules::RuleStore;
use alertflow::store::SqliteStore;
use dotenv::dotenv;
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let config = EngineConfig::from_env();
    info!("batch_once: db {}", config.db_path);

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let rules = Arc::new(RuleStore::new(store.clone()));
    rules.reload().await?;

    let snapshot = rules.snapshot();
    if snapshot.batch.is_empty() {
        info!("no enabled batch rules found");
        return Ok(());
    }

    let metrics = Arc::new(EngineMetrics::new());
    let correlator = BatchCorrelator::new(
        rules.clone(),
        store,
        metrics.clone(),
        Duration::from_secs(config.batch_exec_timeout_secs),
    );

    let (executed, failed) = correlator.run_all_once().await;

    for rule in &snapshot.batch {
        if let Some(exec) = metrics.batch_execution(rule.id) {
            info!(
                "rule {} ({}): {} rows in {}ms, {} errors",
                rule.id, rule.name, exec.last_rows, exec.last_duration_ms, exec.error_count
            );
        }
    }
    info!("batch pass complete: {} executed, {} failed", executed, failed);

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
