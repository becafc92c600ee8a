//! Offset bookkeeping for at-least-once commits.
//!
//! A partition's safe offset is the lowest offset still being processed, or
//! one past the highest consumed offset when nothing is in flight. Only that
//! value is ever committed.

use changeprop_core::error::Result;
use changeprop_msg::{BusMessage, EventConsumer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PartitionState {
    in_flight: BTreeSet<i64>,
    last_consumed: Option<i64>,
    committed: Option<i64>,
}

impl PartitionState {
    fn safe_offset(&self) -> Option<i64> {
        self.in_flight
            .first()
            .copied()
            .or_else(|| self.last_consumed.map(|o| o + 1))
    }
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<(String, i32), PartitionState>,
}

impl OffsetTracker {
    pub fn start(&mut self, topic: &str, partition: i32, offset: i64) {
        let state = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        state.in_flight.insert(offset);
        state.last_consumed = Some(state.last_consumed.map_or(offset, |o| o.max(offset)));
    }

    pub fn finish(&mut self, topic: &str, partition: i32, offset: i64) {
        if let Some(state) = self.partitions.get_mut(&(topic.to_string(), partition)) {
            state.in_flight.remove(&offset);
        }
    }

    pub fn safe_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(PartitionState::safe_offset)
    }

    /// Safe offsets that differ from the last successful commit.
    pub fn pending_commits(&self) -> Vec<(String, i32, i64)> {
        self.partitions
            .iter()
            .filter_map(|((topic, partition), state)| {
                let safe = state.safe_offset()?;
                (state.committed != Some(safe)).then(|| (topic.clone(), *partition, safe))
            })
            .collect()
    }

    /// Records a commit the consumer accepted.
    pub fn mark_committed(&mut self, topic: &str, partition: i32, offset: i64) {
        if let Some(state) = self.partitions.get_mut(&(topic.to_string(), partition)) {
            state.committed = Some(state.committed.map_or(offset, |o| o.max(offset)));
        }
    }
}

struct CommitState {
    tracker: OffsetTracker,
    timer: Option<JoinHandle<()>>,
}

/// Batches commits: the first finished message arms a timer, and when it
/// fires every partition's safe offset is committed.
pub struct Committer {
    consumer: Arc<dyn EventConsumer>,
    interval: Duration,
    state: Mutex<CommitState>,
}

impl Committer {
    pub fn new(consumer: Arc<dyn EventConsumer>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            interval,
            state: Mutex::new(CommitState {
                tracker: OffsetTracker::default(),
                timer: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CommitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self, message: &BusMessage) {
        self.lock()
            .tracker
            .start(&message.topic, message.partition, message.offset);
    }

    pub fn finish(self: &Arc<Self>, message: &BusMessage) {
        let mut state = self.lock();
        state
            .tracker
            .finish(&message.topic, message.partition, message.offset);
        if state.timer.is_none() {
            let committer = Arc::clone(self);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(committer.interval).await;
                committer.commit_due();
            }));
        }
    }

    fn commit_due(&self) {
        let commits = {
            let mut state = self.lock();
            state.timer = None;
            state.tracker.pending_commits()
        };
        for (topic, partition, offset) in commits {
            match self.consumer.commit(&topic, partition, offset) {
                Ok(()) => {
                    debug!(topic = %topic, partition, offset, "committed");
                    self.lock().tracker.mark_committed(&topic, partition, offset);
                }
                Err(e) => warn!(topic = %topic, partition, offset, "commit failed: {e}"),
            }
        }
    }

    /// Cancels a pending timer and commits every safe offset synchronously.
    /// Returns the first failure after attempting all partitions.
    pub async fn flush(&self) -> Result<()> {
        let commits = {
            let mut state = self.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.tracker.pending_commits()
        };
        let mut outcome = Ok(());
        for (topic, partition, offset) in commits {
            match self.consumer.commit_sync(&topic, partition, offset).await {
                Ok(()) => {
                    debug!(topic = %topic, partition, offset, "final commit");
                    self.lock().tracker.mark_committed(&topic, partition, offset);
                }
                Err(e) => {
                    warn!(topic = %topic, partition, offset, "final commit failed: {e}");
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
        }
        outcome
    }

    pub fn safe_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock().tracker.safe_offset(topic, partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use changeprop_core::error::Error;
    use changeprop_msg::memory::MemoryBus;
    use changeprop_msg::ConsumerFactory;

    #[test]
    fn test_watermark_holds_at_lowest_in_flight() {
        let mut tracker = OffsetTracker::default();
        for offset in [5, 6, 7] {
            tracker.start("t", 0, offset);
        }
        assert_eq!(tracker.safe_offset("t", 0), Some(5));

        tracker.finish("t", 0, 6);
        assert_eq!(tracker.safe_offset("t", 0), Some(5));

        tracker.finish("t", 0, 5);
        assert_eq!(tracker.safe_offset("t", 0), Some(7));

        tracker.finish("t", 0, 7);
        assert_eq!(tracker.safe_offset("t", 0), Some(8));
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = OffsetTracker::default();
        tracker.start("t", 0, 10);
        tracker.start("t", 1, 3);
        tracker.finish("t", 1, 3);
        assert_eq!(tracker.safe_offset("t", 0), Some(10));
        assert_eq!(tracker.safe_offset("t", 1), Some(4));
        assert_eq!(tracker.safe_offset("t", 2), None);
    }

    #[test]
    fn test_pending_commits_only_reports_moves() {
        let mut tracker = OffsetTracker::default();
        tracker.start("t", 0, 0);
        assert_eq!(tracker.pending_commits(), vec![("t".to_string(), 0, 0)]);
        tracker.mark_committed("t", 0, 0);
        assert!(tracker.pending_commits().is_empty());
        tracker.finish("t", 0, 0);
        assert_eq!(tracker.pending_commits(), vec![("t".to_string(), 0, 1)]);
    }

    #[test]
    fn test_unmarked_commit_stays_pending() {
        let mut tracker = OffsetTracker::default();
        tracker.start("t", 0, 3);
        tracker.finish("t", 0, 3);
        assert_eq!(tracker.pending_commits(), vec![("t".to_string(), 0, 4)]);
        assert_eq!(tracker.pending_commits(), vec![("t".to_string(), 0, 4)]);
        tracker.mark_committed("t", 0, 4);
        tracker.mark_committed("t", 0, 2);
        assert!(tracker.pending_commits().is_empty());
    }

    fn message(offset: i64) -> BusMessage {
        BusMessage {
            topic: "datacenter1.t".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_is_batched_on_timer() {
        let bus = MemoryBus::default();
        let consumer = bus.create_consumer("g", "t").await.unwrap();
        let committer = Committer::new(consumer, Duration::from_millis(500));

        for offset in [5, 6, 7] {
            committer.start(&message(offset));
        }
        committer.finish(&message(6));
        assert_eq!(bus.committed("g", "datacenter1.t", 0), None);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(bus.committed("g", "datacenter1.t", 0), Some(5));

        committer.finish(&message(5));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(bus.committed("g", "datacenter1.t", 0), Some(7));

        committer.finish(&message(7));
        committer.flush().await.unwrap();
        assert_eq!(bus.committed("g", "datacenter1.t", 0), Some(8));
    }

    /// Records every commit, rejecting the first `fail_first` attempts.
    #[derive(Default)]
    struct RecordingConsumer {
        fail_first: usize,
        attempts: Mutex<Vec<(&'static str, i64)>>,
        accepted: Mutex<Vec<(&'static str, i64)>>,
    }

    impl RecordingConsumer {
        fn record(&self, mode: &'static str, offset: i64) -> Result<()> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push((mode, offset));
            if attempts.len() <= self.fail_first {
                return Err(Error::Kafka("broker unavailable".to_string()));
            }
            self.accepted.lock().unwrap().push((mode, offset));
            Ok(())
        }
    }

    #[async_trait]
    impl EventConsumer for RecordingConsumer {
        async fn recv(&self) -> Result<BusMessage> {
            std::future::pending().await
        }

        fn commit(&self, _topic: &str, _partition: i32, offset: i64) -> Result<()> {
            self.record("async", offset)
        }

        async fn commit_sync(&self, _topic: &str, _partition: i32, offset: i64) -> Result<()> {
            self.record("sync", offset)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_is_retried_by_flush() {
        let consumer = Arc::new(RecordingConsumer {
            fail_first: 1,
            ..Default::default()
        });
        let committer = Committer::new(consumer.clone(), Duration::from_millis(500));

        committer.start(&message(5));
        committer.finish(&message(5));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*consumer.attempts.lock().unwrap(), vec![("async", 6)]);
        assert!(consumer.accepted.lock().unwrap().is_empty());

        committer.flush().await.unwrap();
        assert_eq!(*consumer.accepted.lock().unwrap(), vec![("sync", 6)]);

        committer.flush().await.unwrap();
        assert_eq!(consumer.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_commits_synchronously_and_reports_failure() {
        let consumer = Arc::new(RecordingConsumer {
            fail_first: 1,
            ..Default::default()
        });
        let committer = Committer::new(consumer.clone(), Duration::from_millis(500));

        committer.start(&message(9));
        committer.finish(&message(9));
        assert!(committer.flush().await.is_err());
        assert_eq!(*consumer.attempts.lock().unwrap(), vec![("sync", 10)]);

        // The timer was cancelled by the flush.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(consumer.attempts.lock().unwrap().len(), 1);

        committer.flush().await.unwrap();
        assert_eq!(*consumer.accepted.lock().unwrap(), vec![("sync", 10)]);
    }
}
