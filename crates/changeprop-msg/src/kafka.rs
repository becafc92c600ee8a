use crate::producer::GuaranteedProducer;
use crate::topics::TopicNaming;
use crate::{BusMessage, ConsumerFactory, EventConsumer};
use async_trait::async_trait;
use changeprop_core::config::KafkaConfig;
use changeprop_core::error::{Error, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Builds Kafka clients from configuration.
pub struct KafkaFactory {
    config: KafkaConfig,
    naming: TopicNaming,
}

impl KafkaFactory {
    pub fn new(config: &KafkaConfig) -> Self {
        info!(
            brokers = ?config.brokers,
            consume_dc = %config.consume_dc(),
            produce_dc = %config.produce_dc(),
            "initializing kafka factory"
        );
        Self {
            config: config.clone(),
            naming: TopicNaming::from_config(config),
        }
    }

    pub fn naming(&self) -> &TopicNaming {
        &self.naming
    }

    pub fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "largest")
            .set("allow.auto.create.topics", "true");
        for (key, value) in &self.config.consumer {
            client_config.set(key, value);
        }
        client_config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("request.required.acks", "1");
        for (key, value) in &self.config.producer {
            client_config.set(key, value);
        }
        client_config
    }

    pub fn create_producer(&self) -> Result<GuaranteedProducer> {
        GuaranteedProducer::new(
            &self.producer_config(),
            Duration::from_millis(self.config.poll_interval_ms),
        )
    }
}

#[async_trait]
impl ConsumerFactory for KafkaFactory {
    async fn create_consumer(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Arc<dyn EventConsumer>> {
        let topic = self.naming.consume(topic);
        let consumer: StreamConsumer = self
            .consumer_config(group_id)
            .create()
            .map_err(|e| Error::Kafka(format!("failed to create consumer: {e}")))?;
        consumer
            .subscribe(&[&topic])
            .map_err(|e| Error::Kafka(format!("failed to subscribe to {topic}: {e}")))?;

        info!(topic = %topic, group_id = %group_id, "kafka consumer subscribed");
        Ok(Arc::new(KafkaEventConsumer {
            consumer: Arc::new(consumer),
            topic,
        }))
    }
}

pub struct KafkaEventConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

#[async_trait]
impl EventConsumer for KafkaEventConsumer {
    async fn recv(&self) -> Result<BusMessage> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::Kafka(format!("consume from {} failed: {e}", self.topic)))?;
        Ok(BusMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
        })
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let tpl = commit_list(topic, partition, offset)?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| Error::Kafka(format!("commit failed: {e}")))?;
        debug!(topic = %topic, partition, offset, "offset committed");
        Ok(())
    }

    async fn commit_sync(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let tpl = commit_list(topic, partition, offset)?;
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| Error::Kafka(format!("commit task failed: {e}")))?
            .map_err(|e| Error::Kafka(format!("commit failed: {e}")))?;
        debug!(topic = %topic, partition, offset, "offset committed synchronously");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "kafka consumer closed");
        Ok(())
    }
}

fn commit_list(topic: &str, partition: i32, offset: i64) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
        .map_err(|e| Error::Kafka(format!("invalid commit offset: {e}")))?;
    Ok(tpl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn factory() -> KafkaFactory {
        let config = KafkaConfig {
            brokers: vec!["kafka1:9092".to_string(), "kafka2:9092".to_string()],
            consume_dc: Some("eqiad".to_string()),
            consumer: BTreeMap::from([("fetch.wait.max.ms".to_string(), "50".to_string())]),
            ..KafkaConfig::default()
        };
        KafkaFactory::new(&config)
    }

    #[test]
    fn test_consumer_config() {
        let f = factory();
        let c = f.consumer_config("change-prop-purge");
        assert_eq!(c.get("bootstrap.servers"), Some("kafka1:9092,kafka2:9092"));
        assert_eq!(c.get("group.id"), Some("change-prop-purge"));
        assert_eq!(c.get("enable.auto.commit"), Some("false"));
        assert_eq!(c.get("fetch.wait.max.ms"), Some("50"));
    }

    #[test]
    fn test_producer_config_and_naming() {
        let f = factory();
        assert_eq!(f.producer_config().get("request.required.acks"), Some("1"));
        assert_eq!(f.naming().consume("resource_change"), "eqiad.resource_change");
        assert_eq!(f.naming().produce("resource_change"), "datacenter1.resource_change");
    }
}
