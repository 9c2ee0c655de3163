//! Stream correlator: evaluates threshold rules against the event stream
//!
//! One worker task per bus partition. Each worker fetches a batch, runs
//! every runnable rule against every event, updates the window tracker, and
//! emits raw alerts. The batch is acknowledged only after raised alerts are
//! durably written; a write failure leaves the batch unacknowledged so the
//! bus redelivers it, and the window tracker's delivery-id guard keeps the
//! replay from double-counting.

use crate::alerts::types::{AlertSource, AlertStatus, RawAlert};
use crate::bus::{Delivery, EventBus};
use crate::correlator::windows::EntityWindowTracker;
use crate::error::EngineError;
use crate::events::EventRecord;
use crate::ops::EngineMetrics;
use crate::rules::{RuleStore, StreamRule};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub struct StreamCorrelator {
    rules: Arc<RuleStore>,
    tracker: Arc<EntityWindowTracker>,
    metrics: Arc<EngineMetrics>,
    /// Cap on evidence samples copied into one alert's context.
    max_context_samples: usize,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl StreamCorrelator {
    pub fn new(
        rules: Arc<RuleStore>,
        tracker: Arc<EntityWindowTracker>,
        metrics: Arc<EngineMetrics>,
        max_context_samples: usize,
    ) -> Self {
        Self::new_with_timestamp_fn(
            rules,
            tracker,
            metrics,
            max_context_samples,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    pub fn new_with_timestamp_fn(
        rules: Arc<RuleStore>,
        tracker: Arc<EntityWindowTracker>,
        metrics: Arc<EngineMetrics>,
        max_context_samples: usize,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            rules,
            tracker,
            metrics,
            max_context_samples,
            now_fn,
        }
    }

    /// Evaluate one delivery against the current rule snapshot. Returns the
    /// alerts it raised. A fault in one rule never stops the others.
    pub fn process_delivery(&self, delivery: &Delivery) -> Vec<RawAlert> {
        let snapshot = self.rules.snapshot();
        let event = &delivery.event;
        let mut alerts = Vec::new();

        for rule in snapshot.stream.iter().filter(|r| r.is_runnable()) {
            if !rule.matches(event) {
                continue;
            }

            let entity_key = match resolve_entity(rule, event) {
                Ok(key) => key,
                Err(e) => {
                    // Isolated to this rule/event pair
                    log::debug!("skipping event for rule {}: {}", rule.id, e);
                    self.metrics.record_eval_error(rule.id);
                    continue;
                }
            };

            let observation = self.tracker.observe(
                rule.id,
                &entity_key,
                rule.window_s,
                delivery.id,
                event.ts,
                Some(event.to_json()),
            );

            if observation.hits < rule.threshold {
                continue;
            }

            // Crossing the threshold does not reset the window, so a
            // sustained burst re-fires per event unless the rule asks for a
            // cooldown.
            if rule.cooldown_s > 0 {
                if let Some(last) = observation.last_fired {
                    if event.ts - last < rule.cooldown_s {
                        continue;
                    }
                }
                self.tracker.mark_fired(rule.id, &entity_key, event.ts);
            }

            let mut events = self.tracker.collect_evidence(rule.id, &entity_key);
            events.truncate(self.max_context_samples);

            alerts.push(RawAlert {
                ts: (self.now_fn)(),
                alert_id: uuid::Uuid::new_v4().to_string(),
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                severity: rule.severity,
                ts_first: observation.ts_first,
                ts_last: observation.ts_last,
                window_s: rule.window_s,
                entity_key: entity_key.clone(),
                hits: observation.hits,
                context: serde_json::json!({
                    "rule_id": rule.id,
                    "entity_key": entity_key,
                    "description": rule.description,
                    "events": events,
                }),
                source: AlertSource::Stream,
                status: AlertStatus::Open,
            });
        }

        alerts
    }
}

/// Resolve the rule's entity field on an event that already matched its
/// predicate. A missing or empty value is an evaluation fault scoped to
/// this rule/event pair.
fn resolve_entity(rule: &StreamRule, event: &EventRecord) -> Result<String, EngineError> {
    match event.field(&rule.entity_field) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(EngineError::Evaluation {
            rule_id: rule.id,
            reason: format!("entity field {:?} missing or empty", rule.entity_field),
        }),
    }
}

/// Consumer loop for one bus partition.
///
/// Ordering per batch: evaluate, write alerts, ack, then forward the alerts
/// into the dedup/aggregation pipeline. Alerts are never acknowledged
/// before they are durable.
#[allow(clippy::too_many_arguments)]
pub async fn run_stream_worker(
    partition: usize,
    bus: Arc<dyn EventBus>,
    correlator: Arc<StreamCorrelator>,
    sink: Arc<dyn crate::store::AlertSink>,
    alert_tx: mpsc::Sender<RawAlert>,
    batch_size: usize,
    fetch_timeout: Duration,
    metrics: Arc<EngineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("stream worker {} started", partition);
    let mut backoff = crate::retry::ExponentialBackoff::new(1_000, 30_000);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let deliveries = tokio::select! {
            result = bus.fetch(partition, batch_size, fetch_timeout) => {
                match result {
                    Ok(deliveries) => deliveries,
                    Err(e) => {
                        log::error!("worker {}: fetch failed: {}", partition, e);
                        metrics.record_delivery_fault();
                        backoff.sleep().await;
                        continue;
                    }
                }
            }
            _ = shutdown.changed() => continue,
        };

        if deliveries.is_empty() {
            continue;
        }

        let mut alerts = Vec::new();
        let mut ids = Vec::with_capacity(deliveries.len());
        for delivery in &deliveries {
            alerts.extend(correlator.process_delivery(delivery));
            ids.push(delivery.id);
        }

        if !alerts.is_empty() {
            if let Err(e) = sink.append_raw(&alerts).await {
                // Hold the offsets: the whole batch redelivers and the
                // deduplicator collapses the repeats
                log::error!(
                    "worker {}: alert write failed, holding {} deliveries: {}",
                    partition,
                    ids.len(),
                    e
                );
                metrics.record_delivery_fault();
                backoff.sleep().await;
                continue;
            }
        }
        metrics.record_delivery_ok();
        backoff.reset();

        if let Err(e) = bus.ack(partition, &ids).await {
            log::error!("worker {}: ack failed: {}", partition, e);
        }

        metrics.record_events(deliveries.len() as u64);
        if !alerts.is_empty() {
            metrics.record_raw_alerts(alerts.len() as u64);
            log::info!(
                "worker {}: {} events -> {} alerts",
                partition,
                deliveries.len(),
                alerts.len()
            );
        }

        for alert in alerts {
            if alert_tx.send(alert).await.is_err() {
                log::warn!("worker {}: alert pipeline closed", partition);
                break;
            }
        }
    }

    log::info!("stream worker {} stopped", partition);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::Severity;
    use crate::events::EventRecord;
    use crate::rules::{RuleStore, StreamRule, KIND_THRESHOLD};
    use crate::store::RuleSource;
    use async_trait::async_trait;

    struct FixedRules(std::sync::Mutex<Vec<StreamRule>>);

    impl FixedRules {
        fn new(rules: Vec<StreamRule>) -> Arc<Self> {
            Arc::new(Self(std::sync::Mutex::new(rules)))
        }

        fn set(&self, rules: Vec<StreamRule>) {
            *self.0.lock().unwrap() = rules;
        }
    }

    #[async_trait]
    impl RuleSource for FixedRules {
        async fn load_stream_rules(&self) -> Result<Vec<StreamRule>, crate::error::EngineError> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn load_batch_rules(
            &self,
        ) -> Result<Vec<crate::rules::BatchRule>, crate::error::EngineError> {
            Ok(Vec::new())
        }
    }

    fn make_rule(id: i64, threshold: u32, cooldown_s: i64) -> StreamRule {
        StreamRule {
            id,
            name: format!("rule_{}", id),
            description: "failed logins per source".to_string(),
            enabled: true,
            kind: KIND_THRESHOLD.to_string(),
            severity: Severity::High,
            entity_field: "source_ip".to_string(),
            expr_text: "event.category == 'auth_fail'".to_string(),
            expr: None,
            window_s: 30,
            threshold,
            cooldown_s,
            group_by: Vec::new(),
        }
    }

    async fn correlator_with(
        rules: Vec<StreamRule>,
    ) -> (StreamCorrelator, Arc<RuleStore>, Arc<FixedRules>) {
        let source = FixedRules::new(rules);
        let store = Arc::new(RuleStore::new(source.clone()));
        store.reload().await.unwrap();
        let tracker = Arc::new(EntityWindowTracker::new_with_timestamp_fn(
            5,
            900,
            Box::new(|| 10_000),
        ));
        let metrics = Arc::new(EngineMetrics::new());
        let correlator = StreamCorrelator::new_with_timestamp_fn(
            store.clone(),
            tracker,
            metrics,
            3,
            Box::new(|| 10_000),
        );
        (correlator, store, source)
    }

    fn delivery(id: u64, ts: i64, ip: &str, category: &str) -> Delivery {
        Delivery {
            id,
            event: EventRecord::new(ts)
                .with_field("source_ip", ip)
                .with_field("event.category", category),
        }
    }

    #[tokio::test]
    async fn test_alert_fires_at_threshold_with_exact_hits() {
        let (correlator, _store, _source) = correlator_with(vec![make_rule(1, 5, 0)]).await;

        let mut all = Vec::new();
        for (i, ts) in [0i64, 5, 10, 20, 29].iter().enumerate() {
            all.extend(correlator.process_delivery(&delivery(i as u64, *ts, "10.0.0.1", "auth_fail")));
        }

        assert_eq!(all.len(), 1);
        let alert = &all[0];
        assert_eq!(alert.hits, 5);
        assert_eq!(alert.ts_first, 0);
        assert_eq!(alert.ts_last, 29);
        assert_eq!(alert.entity_key, "10.0.0.1");
        assert_eq!(alert.window_s, 30);
        assert_eq!(alert.status, AlertStatus::Open);
        assert_eq!(alert.source, AlertSource::Stream);
        // Evidence is a bounded sample, not every event
        assert!(alert.context["events"].as_array().unwrap().len() <= 3);
    }

    #[tokio::test]
    async fn test_expired_window_does_not_reach_hits_six() {
        let (correlator, _store, _source) = correlator_with(vec![make_rule(1, 5, 0)]).await;

        for (i, ts) in [0i64, 5, 10, 20, 29].iter().enumerate() {
            correlator.process_delivery(&delivery(i as u64, *ts, "10.0.0.1", "auth_fail"));
        }

        // The 6th event lands after the window expired: fresh count, no alert
        let alerts = correlator.process_delivery(&delivery(5, 60, "10.0.0.1", "auth_fail"));
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_sustained_burst_refires_without_cooldown() {
        let (correlator, _store, _source) = correlator_with(vec![make_rule(1, 3, 0)]).await;

        let mut fired = 0;
        for i in 0..5 {
            fired += correlator
                .process_delivery(&delivery(i, i as i64, "10.0.0.1", "auth_fail"))
                .len();
        }
        // Fires at hits 3, 4, and 5
        assert_eq!(fired, 3);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_refire() {
        let (correlator, _store, _source) = correlator_with(vec![make_rule(1, 3, 30)]).await;

        let mut fired = 0;
        for i in 0..5 {
            fired += correlator
                .process_delivery(&delivery(i, i as i64, "10.0.0.1", "auth_fail"))
                .len();
        }
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn test_non_matching_events_do_not_count() {
        let (correlator, _store, _source) = correlator_with(vec![make_rule(1, 2, 0)]).await;

        assert!(correlator
            .process_delivery(&delivery(0, 0, "10.0.0.1", "login_ok"))
            .is_empty());
        assert!(correlator
            .process_delivery(&delivery(1, 1, "10.0.0.1", "auth_fail"))
            .is_empty());
        // Second matching event crosses threshold 2
        let alerts = correlator.process_delivery(&delivery(2, 2, "10.0.0.1", "auth_fail"));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].hits, 2);
    }

    #[tokio::test]
    async fn test_missing_entity_field_isolated_to_rule() {
        let (correlator, _store, _source) = correlator_with(vec![make_rule(1, 1, 0)]).await;

        let d = Delivery {
            id: 0,
            event: EventRecord::new(0).with_field("event.category", "auth_fail"),
        };
        // Predicate matches but there is no source_ip: no alert, no panic
        assert!(correlator.process_delivery(&d).is_empty());
    }

    #[tokio::test]
    async fn test_rule_disable_mid_window_stops_new_alerts() {
        let (correlator, store, source) = correlator_with(vec![make_rule(1, 5, 0)]).await;

        for (i, ts) in [0i64, 5, 10, 20].iter().enumerate() {
            correlator.process_delivery(&delivery(i as u64, *ts, "10.0.0.1", "auth_fail"));
        }

        // Operator disables the rule; the next reload drops it from the
        // snapshot but leaves the in-flight window alone
        source.set(Vec::new());
        store.reload().await.unwrap();

        let alerts = correlator.process_delivery(&delivery(4, 29, "10.0.0.1", "auth_fail"));
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_entities_counted_independently() {
        let (correlator, _store, _source) = correlator_with(vec![make_rule(1, 2, 0)]).await;

        correlator.process_delivery(&delivery(0, 0, "10.0.0.1", "auth_fail"));
        // A different entity does not inherit the first entity's count
        let alerts = correlator.process_delivery(&delivery(1, 1, "10.0.0.2", "auth_fail"));
        assert!(alerts.is_empty());

        let alerts = correlator.process_delivery(&delivery(2, 2, "10.0.0.1", "auth_fail"));
        assert_eq!(alerts.len(), 1);
    }
}
