//! Event bus abstraction for the stream correlator
//!
//! Consumption is at-least-once: a fetched delivery stays pending until it
//! is acknowledged, and redelivers with the same delivery id once its
//! visibility deadline passes. The trait is the seam for a Streams-style
//! bus; `MemoryBus` backs the runtime and the tests.

use crate::error::EngineError;
use crate::events::EventRecord;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One delivery of an event. `id` is stable across redeliveries, which the
/// window tracker relies on to keep replays from double-counting.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: u64,
    pub event: EventRecord,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    fn partitions(&self) -> usize;

    /// Publish an event. The partition key routes all events for the same
    /// key to the same partition (and therefore the same worker).
    async fn publish(&self, partition_key: &str, event: EventRecord) -> Result<(), EngineError>;

    /// Fetch up to `max` deliveries from one partition, blocking up to
    /// `wait`. Expired pending deliveries are requeued first.
    async fn fetch(
        &self,
        partition: usize,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, EngineError>;

    /// Acknowledge processed deliveries. Unacknowledged deliveries come
    /// back after the visibility timeout.
    async fn ack(&self, partition: usize, ids: &[u64]) -> Result<(), EngineError>;
}

#[derive(Default)]
struct PartitionQueue {
    ready: VecDeque<Delivery>,
    pending: HashMap<u64, (Delivery, Instant)>,
}

/// In-process partitioned bus with visibility-timeout redelivery.
pub struct MemoryBus {
    shards: Vec<Mutex<PartitionQueue>>,
    visibility: Duration,
    next_id: Mutex<u64>,
}

impl MemoryBus {
    pub fn new(partitions: usize, visibility: Duration) -> Self {
        let shards = (0..partitions.max(1))
            .map(|_| Mutex::new(PartitionQueue::default()))
            .collect();
        Self {
            shards,
            visibility,
            next_id: Mutex::new(0),
        }
    }

    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Deliveries sitting unacknowledged across all partitions.
    pub fn pending_len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().pending.len())
            .sum()
    }

    fn try_fetch(&self, partition: usize, max: usize) -> Vec<Delivery> {
        let mut queue = self.shards[partition].lock().unwrap();

        // Requeue deliveries whose visibility deadline has passed
        let now = Instant::now();
        let expired: Vec<u64> = queue
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((delivery, _)) = queue.pending.remove(&id) {
                log::debug!("redelivering unacked delivery {}", id);
                queue.ready.push_back(delivery);
            }
        }

        let mut out = Vec::new();
        while out.len() < max {
            match queue.ready.pop_front() {
                Some(delivery) => {
                    let deadline = now + self.visibility;
                    queue
                        .pending
                        .insert(delivery.id, (delivery.clone(), deadline));
                    out.push(delivery);
                }
                None => break,
            }
        }
        out
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    fn partitions(&self) -> usize {
        self.shards.len()
    }

    async fn publish(&self, partition_key: &str, event: EventRecord) -> Result<(), EngineError> {
        let partition = self.partition_for(partition_key);
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        let mut queue = self.shards[partition].lock().unwrap();
        queue.ready.push_back(Delivery { id, event });
        Ok(())
    }

    async fn fetch(
        &self,
        partition: usize,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, EngineError> {
        if partition >= self.shards.len() {
            return Err(EngineError::Delivery(format!(
                "unknown partition {}",
                partition
            )));
        }

        let deadline = Instant::now() + wait;
        loop {
            let out = self.try_fetch(partition, max);
            if !out.is_empty() || Instant::now() >= deadline {
                return Ok(out);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn ack(&self, partition: usize, ids: &[u64]) -> Result<(), EngineError> {
        if partition >= self.shards.len() {
            return Err(EngineError::Delivery(format!(
                "unknown partition {}",
                partition
            )));
        }
        let mut queue = self.shards[partition].lock().unwrap();
        for id in ids {
            queue.pending.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(ts: i64, ip: &str) -> EventRecord {
        EventRecord::new(ts).with_field("source_ip", ip)
    }

    #[tokio::test]
    async fn test_publish_fetch_ack() {
        let bus = MemoryBus::new(1, Duration::from_secs(30));

        bus.publish("10.0.0.1", make_event(100, "10.0.0.1"))
            .await
            .unwrap();

        let batch = bus.fetch(0, 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(bus.pending_len(), 1);

        bus.ack(0, &[batch[0].id]).await.unwrap();
        assert_eq!(bus.pending_len(), 0);

        // Nothing left to fetch
        let batch = bus.fetch(0, 10, Duration::ZERO).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let bus = MemoryBus::new(4, Duration::from_secs(30));

        for i in 0..5 {
            bus.publish("10.0.0.1", make_event(i, "10.0.0.1"))
                .await
                .unwrap();
        }

        let partition = bus.partition_for("10.0.0.1");
        let batch = bus.fetch(partition, 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 5);
    }

    #[tokio::test]
    async fn test_unacked_delivery_comes_back_with_same_id() {
        let bus = MemoryBus::new(1, Duration::from_millis(10));

        bus.publish("k", make_event(100, "10.0.0.1")).await.unwrap();

        let first = bus.fetch(0, 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        let id = first[0].id;

        // No ack; wait past the visibility deadline
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = bus.fetch(0, 10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, id);
    }

    #[tokio::test]
    async fn test_acked_delivery_never_redelivers() {
        let bus = MemoryBus::new(1, Duration::from_millis(10));

        bus.publish("k", make_event(100, "10.0.0.1")).await.unwrap();
        let batch = bus.fetch(0, 10, Duration::ZERO).await.unwrap();
        bus.ack(0, &[batch[0].id]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let batch = bus.fetch(0, 10, Duration::ZERO).await.unwrap();
        assert!(batch.is_empty());
    }
}
