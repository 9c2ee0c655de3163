pub mod alerts;
pub mod bus;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod ops;
pub mod retry;
pub mod rules;
pub mod store;

pub use alerts::{
    AggregatedAlertGroup, AlertAggregator, AlertDeduplicator, AlertPipeline, AlertSource,
    AlertStatus, DeduplicatedAlert, RawAlert, Severity,
};
pub use bus::{Delivery, EventBus, MemoryBus};
pub use config::EngineConfig;
pub use correlator::{BatchCorrelator, EntityWindowTracker, StreamCorrelator};
pub use error::EngineError;
pub use events::EventRecord;
pub use ops::{EngineMetrics, Health};
pub use rules::{BatchRule, RuleStore, StreamRule};
pub use store::{AlertSink, RuleSource, SqliteStore};
