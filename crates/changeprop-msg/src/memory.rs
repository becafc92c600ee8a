//! In-process stand-in for Kafka, used as a test double by the executor and
//! API test suites. It is not wired into the binary.
//!
//! Every topic is a single partition (0). Consumers start from their group's
//! committed offset, or from the beginning of the topic. Commits are applied
//! immediately, so `commit` and `commit_sync` behave the same.

use crate::topics::TopicNaming;
use crate::{BusMessage, ConsumerFactory, EventConsumer, EventProducer};
use async_trait::async_trait;
use changeprop_core::error::{Error, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<BusMessage>>,
    committed: HashMap<(String, String, i32), i64>,
    failing: HashSet<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BusState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    shared: Arc<Shared>,
    naming: TopicNaming,
}

impl MemoryBus {
    pub fn new(naming: TopicNaming) -> Self {
        Self {
            shared: Arc::default(),
            naming,
        }
    }

    pub fn naming(&self) -> &TopicNaming {
        &self.naming
    }

    /// Appends a raw payload to a full topic name, returning its offset.
    pub fn publish_raw(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> i64 {
        let offset = {
            let mut state = self.shared.lock();
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(BusMessage {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: key.map(<[u8]>::to_vec),
                payload: Some(payload.to_vec()),
            });
            offset
        };
        self.shared.notify.notify_waiters();
        offset
    }

    pub fn publish_json(&self, topic: &str, value: &Value) -> i64 {
        self.publish_raw(topic, None, value.to_string().as_bytes())
    }

    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        self.shared
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Payloads of `topic` that parse as JSON.
    pub fn json_messages(&self, topic: &str) -> Vec<Value> {
        self.messages(topic)
            .iter()
            .filter_map(|m| m.payload.as_deref())
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }

    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Makes every produce to `topic` fail until cleared.
    pub fn fail_topic(&self, topic: &str, failing: bool) {
        let mut state = self.shared.lock();
        if failing {
            state.failing.insert(topic.to_string());
        } else {
            state.failing.remove(topic);
        }
    }
}

#[async_trait]
impl EventProducer for MemoryBus {
    async fn produce(
        &self,
        topic: &str,
        _partition: Option<i32>,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<()> {
        if self.shared.lock().failing.contains(topic) {
            return Err(Error::produce(topic, "topic unavailable"));
        }
        let offset = self.publish_raw(topic, key, payload);
        debug!(topic = %topic, offset, "memory bus: produced");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ConsumerFactory for MemoryBus {
    async fn create_consumer(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Arc<dyn EventConsumer>> {
        let topic = self.naming.consume(topic);
        let start = self.committed(group_id, &topic, 0).unwrap_or(0);
        Ok(Arc::new(MemoryConsumer {
            shared: self.shared.clone(),
            group_id: group_id.to_string(),
            topic,
            position: AtomicI64::new(start),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    topic: String,
    position: AtomicI64,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn try_next(&self) -> Option<BusMessage> {
        let state = self.shared.lock();
        let position = self.position.load(Ordering::SeqCst);
        let message = state.topics.get(&self.topic)?.get(position as usize)?.clone();
        self.position.store(position + 1, Ordering::SeqCst);
        Some(message)
    }
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn recv(&self) -> Result<BusMessage> {
        loop {
            let notified = self.shared.notify.notified();
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Kafka(format!("consumer for {} closed", self.topic)));
            }
            if let Some(message) = self.try_next() {
                return Ok(message);
            }
            notified.await;
        }
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.shared
            .lock()
            .committed
            .insert((self.group_id.clone(), topic.to_string(), partition), offset);
        Ok(())
    }

    async fn commit_sync(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.commit(topic, partition, offset)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_produce_then_consume() {
        let bus = MemoryBus::default();
        bus.produce("datacenter1.t", None, None, b"one").await.unwrap();

        let consumer = bus.create_consumer("g", "t").await.unwrap();
        let first = consumer.recv().await.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.payload_str(), "one");

        let pending = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.recv().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish_json("datacenter1.t", &json!({ "n": 2 }));
        let second = pending.await.unwrap().unwrap();
        assert_eq!(second.offset, 1);
    }

    #[tokio::test]
    async fn test_consumer_resumes_from_commit() {
        let bus = MemoryBus::default();
        for i in 0..3 {
            bus.publish_json("datacenter1.t", &json!({ "n": i }));
        }
        let consumer = bus.create_consumer("g", "t").await.unwrap();
        consumer.recv().await.unwrap();
        consumer.commit("datacenter1.t", 0, 1).unwrap();
        consumer.close().await.unwrap();
        assert!(consumer.recv().await.is_err());

        assert_eq!(bus.committed("g", "datacenter1.t", 0), Some(1));
        let resumed = bus.create_consumer("g", "t").await.unwrap();
        assert_eq!(resumed.recv().await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_commit_sync_is_visible_at_once() {
        let bus = MemoryBus::default();
        let consumer = bus.create_consumer("g", "t").await.unwrap();
        consumer.commit_sync("datacenter1.t", 0, 4).await.unwrap();
        assert_eq!(bus.committed("g", "datacenter1.t", 0), Some(4));
        assert_eq!(bus.committed("other", "datacenter1.t", 0), None);
    }

    #[tokio::test]
    async fn test_failing_topic() {
        let bus = MemoryBus::default();
        bus.fail_topic("x", true);
        assert!(bus.produce("x", None, None, b"{}").await.is_err());
        bus.fail_topic("x", false);
        assert!(bus.produce("x", None, None, b"{}").await.is_ok());
        assert_eq!(bus.messages("x").len(), 1);
    }
}
