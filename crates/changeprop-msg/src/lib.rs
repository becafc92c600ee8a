pub mod kafka;
pub mod memory;
pub mod producer;
pub mod publisher;
pub mod topics;

use async_trait::async_trait;
use changeprop_core::error::Result;
use std::sync::Arc;

/// A record pulled off a topic partition.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Full topic name, datacenter prefix included.
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

impl BusMessage {
    /// Payload as text, lossy for invalid UTF-8.
    pub fn payload_str(&self) -> String {
        self.payload
            .as_deref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    }
}

/// Consumer side of the bus, bound to one topic and one consumer group.
#[async_trait]
pub trait EventConsumer: Send + Sync + 'static {
    async fn recv(&self) -> Result<BusMessage>;

    /// Marks everything before `offset` on the partition as consumed.
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Like `commit`, but resolves only once the broker has stored the
    /// offset. Used for the final commit before a consumer closes.
    async fn commit_sync(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Producer side of the bus. `produce` resolves only once the broker has
/// acknowledged the record.
#[async_trait]
pub trait EventProducer: Send + Sync + 'static {
    async fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConsumerFactory: Send + Sync + 'static {
    /// Subscribes a new consumer in `group_id` to the consume-side name of
    /// the logical `topic`.
    async fn create_consumer(&self, group_id: &str, topic: &str)
        -> Result<Arc<dyn EventConsumer>>;
}
