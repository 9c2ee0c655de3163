//! Engine configuration from environment variables

use std::env;

/// Configuration for the correlation engine runtime.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deployment environment label (for log context)
    pub env: String,

    /// Instance name (for log context and consumer naming)
    pub instance: String,

    /// Path to the SQLite database file
    pub db_path: String,

    /// Master enable flag for the engine runtime
    pub enabled: bool,

    /// Number of bus partitions / stream worker tasks
    pub partitions: usize,

    /// Event field used as the bus partition key when replaying events
    pub partition_field: String,

    /// Max events fetched from a partition per poll
    pub fetch_batch_size: usize,

    /// How long a fetch blocks waiting for events (milliseconds)
    pub fetch_timeout_ms: u64,

    /// Redelivery deadline for unacknowledged deliveries (milliseconds)
    pub visibility_timeout_ms: u64,

    /// Buffer size of the raw-alert channel into the dedup/agg pipeline
    pub alert_channel_buffer: usize,

    /// Dedup/aggregate flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// Rule snapshot reload interval in seconds
    pub rule_reload_secs: u64,

    /// Batch scheduler poll granularity in milliseconds
    pub batch_poll_ms: u64,

    /// Bounded timeout for a single batch rule execution (seconds)
    pub batch_exec_timeout_secs: u64,

    /// Entity window idle-eviction sweep interval (seconds)
    pub window_sweep_secs: u64,

    /// Idle ceiling after which an untouched entity window is evicted (seconds)
    pub window_idle_secs: i64,

    /// Max evidence samples retained per entity window
    pub max_window_evidence: usize,

    /// Max evidence samples retained per aggregated alert group
    pub max_group_samples: usize,

    /// Retention period for alert rows and settled in-memory alert state
    /// (seconds). Expired records are purged by the periodic sweep.
    pub retention_secs: i64,

    /// Optional JSONL file of events to replay into the bus at startup
    pub events_path: Option<String>,
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ALERTFLOW_ENV` (default: dev)
    /// - `ALERTFLOW_INSTANCE` (default: dev-instance)
    /// - `ALERTFLOW_DB_PATH` (default: /var/lib/alertflow/alertflow.db)
    /// - `ALERTFLOW_ENABLED` (default: true)
    /// - `ALERTFLOW_PARTITIONS` (default: 4)
    /// - `ALERTFLOW_PARTITION_FIELD` (default: host)
    /// - `ALERTFLOW_FETCH_BATCH_SIZE` (default: 200)
    /// - `ALERTFLOW_FETCH_TIMEOUT_MS` (default: 5000)
    /// - `ALERTFLOW_VISIBILITY_TIMEOUT_MS` (default: 30000)
    /// - `ALERTFLOW_ALERT_CHANNEL_BUFFER` (default: 10000)
    /// - `ALERTFLOW_FLUSH_INTERVAL_MS` (default: 5000)
    /// - `ALERTFLOW_RULE_RELOAD_SECS` (default: 60)
    /// - `ALERTFLOW_BATCH_POLL_MS` (default: 1000)
    /// - `ALERTFLOW_BATCH_EXEC_TIMEOUT_SECS` (default: 10)
    /// - `ALERTFLOW_WINDOW_SWEEP_SECS` (default: 60)
    /// - `ALERTFLOW_WINDOW_IDLE_SECS` (default: 900)
    /// - `ALERTFLOW_MAX_WINDOW_EVIDENCE` (default: 5)
    /// - `ALERTFLOW_MAX_GROUP_SAMPLES` (default: 3)
    /// - `ALERTFLOW_RETENTION_SECS` (default: 604800, 7 days)
    /// - `ALERTFLOW_EVENTS_PATH` (no default; replay disabled when unset)
    pub fn from_env() -> Self {
        Self {
            env: env::var("ALERTFLOW_ENV").unwrap_or_else(|_| "dev".to_string()),

            instance: env::var("ALERTFLOW_INSTANCE")
                .unwrap_or_else(|_| "dev-instance".to_string()),

            db_path: env::var("ALERTFLOW_DB_PATH")
                .unwrap_or_else(|_| "/var/lib/alertflow/alertflow.db".to_string()),

            enabled: env::var("ALERTFLOW_ENABLED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),

            partitions: parse_env("ALERTFLOW_PARTITIONS", 4),
            partition_field: env::var("ALERTFLOW_PARTITION_FIELD")
                .unwrap_or_else(|_| "host".to_string()),
            fetch_batch_size: parse_env("ALERTFLOW_FETCH_BATCH_SIZE", 200),
            fetch_timeout_ms: parse_env("ALERTFLOW_FETCH_TIMEOUT_MS", 5_000),
            visibility_timeout_ms: parse_env("ALERTFLOW_VISIBILITY_TIMEOUT_MS", 30_000),
            alert_channel_buffer: parse_env("ALERTFLOW_ALERT_CHANNEL_BUFFER", 10_000),
            flush_interval_ms: parse_env("ALERTFLOW_FLUSH_INTERVAL_MS", 5_000),
            rule_reload_secs: parse_env("ALERTFLOW_RULE_RELOAD_SECS", 60),
            batch_poll_ms: parse_env("ALERTFLOW_BATCH_POLL_MS", 1_000),
            batch_exec_timeout_secs: parse_env("ALERTFLOW_BATCH_EXEC_TIMEOUT_SECS", 10),
            window_sweep_secs: parse_env("ALERTFLOW_WINDOW_SWEEP_SECS", 60),
            window_idle_secs: parse_env("ALERTFLOW_WINDOW_IDLE_SECS", 900),
            max_window_evidence: parse_env("ALERTFLOW_MAX_WINDOW_EVIDENCE", 5),
            max_group_samples: parse_env("ALERTFLOW_MAX_GROUP_SAMPLES", 3),
            retention_secs: parse_env("ALERTFLOW_RETENTION_SECS", 604_800),

            events_path: env::var("ALERTFLOW_EVENTS_PATH").ok(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
