use crate::EventProducer;
use async_trait::async_trait;
use changeprop_core::error::{Error, Result};
use dashmap::DashMap;
use metrics::counter;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Completion = oneshot::Sender<std::result::Result<(), String>>;

/// Routes delivery reports back to the `produce` call waiting on them.
#[derive(Default)]
pub struct DeliveryContext {
    pending: DashMap<u64, Completion>,
}

impl DeliveryContext {
    /// Starts waiting for the delivery report of `token`.
    fn register(&self, token: u64) -> oneshot::Receiver<std::result::Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token, tx);
        rx
    }

    /// Drops the waiter of a record that never reached the client queue.
    fn forget(&self, token: u64) {
        self.pending.remove(&token);
    }

    fn complete(&self, token: u64, outcome: std::result::Result<(), String>) {
        let Some((_, completion)) = self.pending.remove(&token) else {
            warn!(token, "delivery report for unknown token");
            return;
        };
        // The caller may have gone away; nothing left to notify then.
        let _ = completion.send(outcome);
    }
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<u64>;

    fn delivery(&self, result: &DeliveryResult<'_>, token: Self::DeliveryOpaque) {
        let outcome = match result {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(e.to_string()),
        };
        self.complete(*token, outcome);
    }
}

/// Kafka producer whose `produce` resolves on the broker's delivery report.
///
/// Each record carries an opaque token; the delivery callback looks the token
/// up and completes the matching oneshot. A background task polls the client
/// so callbacks are served.
pub struct GuaranteedProducer {
    producer: Arc<BaseProducer<DeliveryContext>>,
    next_token: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl GuaranteedProducer {
    pub fn new(client_config: &ClientConfig, poll_interval: Duration) -> Result<Self> {
        let producer: BaseProducer<DeliveryContext> = client_config
            .create_with_context(DeliveryContext::default())
            .map_err(|e| Error::Kafka(format!("failed to create producer: {e}")))?;
        let producer = Arc::new(producer);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = tokio::spawn(poll_loop(producer.clone(), poll_interval, shutdown_rx));

        info!(poll_interval_ms = poll_interval.as_millis() as u64, "producer started");

        Ok(Self {
            producer,
            next_token: AtomicU64::new(0),
            shutdown_tx,
            poller: Mutex::new(Some(poller)),
        })
    }
}

async fn poll_loop(
    producer: Arc<BaseProducer<DeliveryContext>>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                producer.poll(Duration::ZERO);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("producer poller shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl EventProducer for GuaranteedProducer {
    async fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<()> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let rx = self.producer.context().register(token);

        let mut record: BaseRecord<'_, [u8], [u8], Box<u64>> =
            BaseRecord::with_opaque_to(topic, Box::new(token)).payload(payload);
        if let Some(partition) = partition {
            record = record.partition(partition);
        }
        if let Some(key) = key {
            record = record.key(key);
        }

        if let Err((e, _)) = self.producer.send(record) {
            self.producer.context().forget(token);
            counter!("changeprop_produce_failed_total", "topic" => topic.to_string()).increment(1);
            return Err(Error::produce(topic, e));
        }

        match rx.await {
            Ok(Ok(())) => {
                counter!("changeprop_produce_total", "topic" => topic.to_string()).increment(1);
                Ok(())
            }
            Ok(Err(reason)) => {
                counter!("changeprop_produce_failed_total", "topic" => topic.to_string())
                    .increment(1);
                Err(Error::produce(topic, reason))
            }
            Err(_) => Err(Error::produce(topic, "delivery report dropped")),
        }
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || {
            producer.flush(Timeout::After(Duration::from_secs(10)))
        })
        .await
        .map_err(|e| Error::Kafka(format!("flush task failed: {e}")))?;
        if let Err(e) = flushed {
            error!("producer flush failed: {e}");
        }

        let _ = self.shutdown_tx.send(true);
        let poller = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        info!("producer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_reach_their_own_caller() {
        let context = DeliveryContext::default();
        let first = context.register(1);
        let second = context.register(2);

        context.complete(2, Err("Broker: Leader not available".to_string()));
        context.complete(1, Ok(()));

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(
            second.await.unwrap(),
            Err("Broker: Leader not available".to_string())
        );
        assert!(context.pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_abandoned_tokens() {
        let context = DeliveryContext::default();
        context.complete(42, Ok(()));

        drop(context.register(7));
        context.complete(7, Ok(()));
        assert!(context.pending.is_empty());

        let forgotten = context.register(8);
        context.forget(8);
        assert!(forgotten.await.is_err());
    }

    #[tokio::test]
    async fn test_undeliverable_record_fails_produce() {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", "127.0.0.1:1")
            .set("message.timeout.ms", "200");
        let producer = GuaranteedProducer::new(&config, Duration::from_millis(10)).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(30),
            producer.produce("changeprop-test", None, Some(b"k"), b"{}"),
        )
        .await
        .unwrap();
        match result {
            Err(Error::Produce { topic, .. }) => assert_eq!(topic, "changeprop-test"),
            other => panic!("expected produce error, got {other:?}"),
        }
        assert!(producer.producer.context().pending.is_empty());
        producer.close().await.unwrap();
    }
}
