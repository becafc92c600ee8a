use crate::topics::TopicNaming;
use crate::EventProducer;
use changeprop_core::error::{Error, Result};
use changeprop_core::types::stamp_meta;
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Events should be a non-empty array")]
    Empty,

    #[error("Event must have a meta.topic property")]
    MissingTopic(Value),

    #[error(transparent)]
    Produce(#[from] Error),
}

/// Publishes events to their produce-side topics through a reliable producer.
#[derive(Clone)]
pub struct EventPublisher {
    producer: Arc<dyn EventProducer>,
    naming: TopicNaming,
}

impl EventPublisher {
    pub fn new(producer: Arc<dyn EventProducer>, naming: TopicNaming) -> Self {
        Self { producer, naming }
    }

    pub fn naming(&self) -> &TopicNaming {
        &self.naming
    }

    /// Validates the whole batch before producing any of it. Each event gets
    /// `meta.id`/`meta.dt` if it has none and goes to `<dc>.<meta.topic>`.
    pub async fn publish_events(&self, events: Vec<Value>) -> std::result::Result<(), PublishError> {
        if events.is_empty() {
            return Err(PublishError::Empty);
        }
        if let Some(bad) = events.iter().find(|e| topic_of(e).is_none()) {
            return Err(PublishError::MissingTopic(bad.clone()));
        }

        try_join_all(events.into_iter().map(|mut event| async move {
            stamp_meta(&mut event)?;
            let topic = topic_of(&event).unwrap_or_default().to_string();
            self.publish_value(&topic, &event).await
        }))
        .await?;
        Ok(())
    }

    /// Serializes `message`, stamps its meta, and produces it to the
    /// produce-side name of the logical `topic`.
    pub async fn publish<T: Serialize + Sync>(&self, topic: &str, message: &T) -> Result<()> {
        let mut value = serde_json::to_value(message)?;
        if value.get("meta").is_some() {
            stamp_meta(&mut value)?;
        }
        self.publish_value(topic, &value).await
    }

    async fn publish_value(&self, topic: &str, value: &Value) -> Result<()> {
        let full_topic = self.naming.produce(topic);
        let payload = serde_json::to_vec(value)?;
        self.producer
            .produce(&full_topic, Some(0), None, &payload)
            .await?;
        debug!(topic = %full_topic, "event published");
        Ok(())
    }

    /// Produces a keyed record, used for control messages.
    pub async fn publish_keyed(&self, topic: &str, key: &str, value: &Value) -> Result<()> {
        let full_topic = self.naming.produce(topic);
        let payload = serde_json::to_vec(value)?;
        self.producer
            .produce(&full_topic, None, Some(key.as_bytes()), &payload)
            .await
    }
}

fn topic_of(event: &Value) -> Option<&str> {
    event
        .pointer("/meta/topic")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
}
