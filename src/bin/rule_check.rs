//! Rule definition validator
//!
//! Loads every enabled rule from the store, compiles stream predicates and
//! checks batch invariants, and reports the rules that would be disabled at
//! load time. Exits nonzero when any rule is invalid, so it can gate rule
//! deployments.
//!
//! Usage:
//!   cargo run --release --bin rule_check

use alertflow::config::EngineConfig;
use alertflow::store::{RuleSource, SqliteStore};
use dotenv::dotenv;
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let config = EngineConfig::from_env();
    info!("rule_check: db {}", config.db_path);

    let store = SqliteStore::open(&config.db_path)?;
    let mut invalid = 0;

    let stream_rules = store.load_stream_rules().await?;
    for mut rule in stream_rules {
        match rule.compile() {
            Ok(()) => info!(
                "✅ stream rule {} ({}): window {}s, threshold {}",
                rule.id, rule.name, rule.window_s, rule.threshold
            ),
            Err(e) => {
                invalid += 1;
                error!("❌ stream rule {} ({}): {}", rule.id, rule.name, e);
            }
        }
    }

    let batch_rules = store.load_batch_rules().await?;
    for rule in batch_rules {
        match rule.validate() {
            Ok(()) => info!(
                "✅ batch rule {} ({}): every {}s, lookback {}s",
                rule.id, rule.name, rule.interval_s, rule.lookback_s
            ),
            Err(e) => {
                invalid += 1;
                error!("❌ batch rule {} ({}): {}", rule.id, rule.name, e);
            }
        }
    }

    if invalid > 0 {
        error!("{} rule(s) would be disabled at load", invalid);
        std::process::exit(1);
    }
    info!("all rules valid");
    Ok(())
}
