use crate::watermark::Committer;
use async_trait::async_trait;
use changeprop_core::config::ExecutorConfig;
use changeprop_core::error::Result;
use changeprop_msg::{BusMessage, ConsumerFactory, EventConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// What a concrete executor contributes to the shared consume loop.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Logical topic to consume, without datacenter prefix.
    fn subscribe_topic(&self) -> String;

    fn consumer_group(&self) -> String;

    /// Worker count override.
    fn concurrency(&self) -> Option<usize> {
        None
    }

    /// Handles one message completely, failures included. The message's
    /// offset becomes committable once this returns.
    async fn on_message(&self, message: &BusMessage);
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub commit_interval: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            commit_interval: Duration::from_millis(config.commit_interval_ms),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

/// Consumes one topic and dispatches messages to a handler with bounded
/// concurrency, committing offsets through the watermark.
pub struct Executor {
    topic: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Executor {
    pub async fn start(
        handler: Arc<dyn MessageHandler>,
        factory: &dyn ConsumerFactory,
        settings: ExecutorSettings,
    ) -> Result<Self> {
        let topic = handler.subscribe_topic();
        let group = handler.consumer_group();
        let concurrency = handler.concurrency().unwrap_or(settings.concurrency).max(1);

        let consumer = factory.create_consumer(&group, &topic).await?;
        let committer = Committer::new(consumer.clone(), settings.commit_interval);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(topic = %topic, group = %group, concurrency, "executor started");

        let task = tokio::spawn(run(handler, consumer, committer, concurrency, shutdown_rx));
        Ok(Self {
            topic,
            shutdown_tx,
            task,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stops pulling, waits for in-flight messages to finish, forces a final
    /// commit and closes the consumer.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(topic = %self.topic, "executor task failed: {e}");
        }
        info!(topic = %self.topic, "executor closed");
    }
}

async fn run(
    handler: Arc<dyn MessageHandler>,
    consumer: Arc<dyn EventConsumer>,
    committer: Arc<Committer>,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    loop {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let received = tokio::select! {
            received = consumer.recv() => received,
            _ = shutdown.changed() => break,
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                warn!("consume failed: {e}");
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        committer.start(&message);
        let handler = handler.clone();
        let committer = committer.clone();
        tasks.spawn(async move {
            handler.on_message(&message).await;
            committer.finish(&message);
            drop(permit);
        });

        // Reap finished tasks so the set does not grow unbounded.
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!("message task failed: {e}");
            }
        }
    }

    debug!(in_flight = tasks.len(), "executor loop stopped, draining");
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!("message task failed: {e}");
        }
    }
    if let Err(e) = committer.flush().await {
        warn!("final offset commit failed: {e}");
    }
    if let Err(e) = consumer.close().await {
        warn!("consumer close failed: {e}");
    }
}
