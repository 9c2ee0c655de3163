//! Alert pipeline: raw alerts -> deduplication -> aggregation -> store
//!
//! A single task owns both the deduplicator and the aggregator, fed by an
//! mpsc channel from the stream workers. Same-group absorbs are serialized
//! by construction; the store only sees periodic replace-by-key flushes,
//! never a per-absorb round trip. The channel is the low-latency path; the
//! flush tick additionally walks `alerts_raw` by rowid cursor, which picks
//! up batch-produced meta-alerts and re-covers anything written before a
//! crash. Re-absorbing a channel-delivered alert is idempotent.

use crate::alerts::aggregator::AlertAggregator;
use crate::alerts::dedup::AlertDeduplicator;
use crate::alerts::types::RawAlert;
use crate::ops::EngineMetrics;
use crate::store::AlertSink;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};

pub struct AlertPipeline {
    pub dedup: Arc<AlertDeduplicator>,
    pub aggregator: Arc<AlertAggregator>,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<EngineMetrics>,
    /// Cursor over alerts_raw rowids.
    raw_cursor: std::sync::Mutex<i64>,
}

impl AlertPipeline {
    pub fn new(
        dedup: Arc<AlertDeduplicator>,
        aggregator: Arc<AlertAggregator>,
        sink: Arc<dyn AlertSink>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            dedup,
            aggregator,
            sink,
            metrics,
            raw_cursor: std::sync::Mutex::new(0),
        }
    }

    /// Warm start: rebuild the in-memory projection and group state from
    /// the persisted deduplicated view.
    pub async fn preload(&self) -> Result<(), crate::error::EngineError> {
        let state = self.sink.load_dedup_state().await?;
        if state.is_empty() {
            return Ok(());
        }
        log::info!("preloading {} deduplicated alerts", state.len());
        for alert in &state {
            self.aggregator.absorb(alert);
        }
        self.dedup.preload(state);
        // Rebuilt groups are flushed on the first tick
        Ok(())
    }

    pub fn absorb(&self, alert: &RawAlert) {
        let merged = self.dedup.absorb(alert);
        self.aggregator.absorb(&merged);
    }

    /// Walk newly appended raw alerts. This picks up batch-produced
    /// meta-alerts (which never travel the channel) and re-covers stream
    /// alerts whose channel delivery was lost to a crash. The history may
    /// be incomplete at read time; that is eventual consistency, not an
    /// error.
    async fn absorb_appended_alerts(&self) {
        let cursor = *self.raw_cursor.lock().unwrap();
        match self.sink.load_alerts_after(cursor).await {
            Ok((alerts, new_cursor)) => {
                if !alerts.is_empty() {
                    log::debug!("absorbing {} appended raw alerts", alerts.len());
                }
                for alert in &alerts {
                    self.absorb(alert);
                }
                *self.raw_cursor.lock().unwrap() = new_cursor;
            }
            Err(e) => {
                log::warn!("raw alert read failed, will retry next flush: {}", e);
            }
        }
    }

    /// Flush dirty dedup records and groups. Failed writes stay dirty and
    /// retry on the next tick.
    pub async fn flush(&self) {
        self.absorb_appended_alerts().await;

        let dirty_dedup = self.dedup.drain_dirty();
        if !dirty_dedup.is_empty() {
            match self.sink.replace_dedup(&dirty_dedup).await {
                Ok(()) => {
                    self.metrics.record_dedup_flush(dirty_dedup.len() as u64);
                    self.metrics.record_delivery_ok();
                }
                Err(e) => {
                    log::error!("dedup flush failed ({} records): {}", dirty_dedup.len(), e);
                    self.metrics.record_delivery_fault();
                    self.dedup.restore_dirty(&dirty_dedup);
                    return;
                }
            }
        }

        let dirty_groups = self.aggregator.drain_dirty();
        if !dirty_groups.is_empty() {
            match self.sink.upsert_groups(&dirty_groups).await {
                Ok(()) => {
                    self.metrics.record_group_flush(dirty_groups.len() as u64);
                    log::debug!("flushed {} alert groups", dirty_groups.len());
                }
                Err(e) => {
                    log::error!("group flush failed ({} groups): {}", dirty_groups.len(), e);
                    self.metrics.record_delivery_fault();
                    self.aggregator.restore_dirty(&dirty_groups);
                }
            }
        }
    }
}

/// Pipeline task: consume raw alerts and flush on an interval. On shutdown
/// or channel close, drain what is buffered and do a final flush.
pub async fn run_alert_pipeline(
    pipeline: Arc<AlertPipeline>,
    mut rx: mpsc::Receiver<RawAlert>,
    flush_interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!(
        "alert pipeline started (flush every {}ms)",
        flush_interval_ms
    );
    let mut flush_timer = interval(Duration::from_millis(flush_interval_ms));

    loop {
        tokio::select! {
            maybe_alert = rx.recv() => {
                match maybe_alert {
                    Some(alert) => pipeline.absorb(&alert),
                    None => {
                        log::warn!("alert channel closed, stopping pipeline");
                        break;
                    }
                }
            }
            _ = flush_timer.tick() => {
                pipeline.flush().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Drain whatever is still buffered, then flush once more
    while let Ok(alert) = rx.try_recv() {
        pipeline.absorb(&alert);
    }
    pipeline.flush().await;
    log::info!("alert pipeline stopped");
}
