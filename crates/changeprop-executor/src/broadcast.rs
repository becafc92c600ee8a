//! Dynamic rule registration over a control topic. Each record is keyed by
//! the rule name and carries the rule as JSON.

use crate::registry::RuleRegistry;
use changeprop_core::error::{Error, Result};
use changeprop_core::rule::RuleSpec;
use changeprop_msg::publisher::EventPublisher;
use changeprop_msg::{BusMessage, ConsumerFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct RuleBroadcaster {
    publisher: EventPublisher,
    topic: String,
}

impl RuleBroadcaster {
    pub fn new(publisher: EventPublisher, topic: &str) -> Self {
        Self {
            publisher,
            topic: topic.to_string(),
        }
    }

    pub async fn notify_new_rule(&self, name: &str, spec: &RuleSpec) -> Result<()> {
        let value = serde_json::to_value(spec)?;
        self.publisher.publish_keyed(&self.topic, name, &value).await?;
        info!(rule = %name, topic = %self.topic, "rule broadcast");
        Ok(())
    }
}

/// Feeds rule registrations from the control topic into the registry.
pub struct RuleBroadcastListener {
    registry: Arc<RuleRegistry>,
    factory: Arc<dyn ConsumerFactory>,
    topic: String,
    group_id: String,
}

impl RuleBroadcastListener {
    pub fn new(registry: Arc<RuleRegistry>, factory: Arc<dyn ConsumerFactory>, topic: &str) -> Self {
        Self {
            registry,
            factory,
            topic: topic.to_string(),
            // Every process sees every registration.
            group_id: format!("change-prop-rule-consumer-{}", std::process::id()),
        }
    }

    pub fn with_group_id(mut self, group_id: &str) -> Self {
        self.group_id = group_id.to_string();
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let consumer = self
            .factory
            .create_consumer(&self.group_id, &self.topic)
            .await?;
        info!(topic = %self.topic, group_id = %self.group_id, "rule broadcast listener started");

        loop {
            tokio::select! {
                received = consumer.recv() => match received {
                    Ok(message) => {
                        if let Err(e) = self.apply(&message).await {
                            error!(offset = message.offset, "rule registration failed: {e}");
                        }
                        if let Err(e) = consumer.commit(&message.topic, message.partition, message.offset + 1) {
                            warn!("rule consumer commit failed: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("rule consumer error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("rule broadcast listener shutting down");
                        break;
                    }
                }
            }
        }

        consumer.close().await
    }

    async fn apply(&self, message: &BusMessage) -> Result<()> {
        let name = message
            .key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::InvalidEvent("rule message without a key".to_string()))?;
        let payload = message.payload.as_deref().unwrap_or_default();
        let spec: RuleSpec = serde_json::from_slice(payload)?;
        let outcome = self.registry.subscribe_rule(&name, spec).await?;
        info!(rule = %name, outcome = ?outcome, "rule update consumed");
        Ok(())
    }
}
