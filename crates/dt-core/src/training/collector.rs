//! Training collector and the fire-and-forget archive hand-off.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::{PersistenceError, SampleStore};
use super::{Confirmation, LabeledSample};
use crate::decision::{Decision, Verdict};
use crate::features::FeatureRecord;

/// Owner of the training archive.
pub struct TrainingCollector {
    store: Arc<dyn SampleStore>,
}

impl TrainingCollector {
    pub fn new(store: Arc<dyn SampleStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SampleStore> {
        &self.store
    }

    /// Archives a weakly labeled sample for a decision.
    pub async fn record(
        &self,
        features: FeatureRecord,
        decision: &Decision,
    ) -> Result<(), PersistenceError> {
        let sample = LabeledSample::weak(features, decision);
        self.store.append(sample).await.map_err(|e| {
            metrics::counter!("droptest_archive_failures_total").increment(1);
            warn!(decision_id = %decision.id, error = %e, "Failed to archive decision");
            e
        })
    }

    /// Upgrades a sample to a strong, human-confirmed label.
    pub async fn confirm(
        &self,
        sample_id: Uuid,
        label: Verdict,
        reviewer: Option<String>,
    ) -> Result<LabeledSample, PersistenceError> {
        let sample = self
            .store
            .confirm(Confirmation::new(sample_id, label, reviewer))
            .await?;
        info!(
            sample_id = %sample_id,
            label = %label,
            overridden = sample.was_overridden(),
            "Confirmed sample label"
        );
        Ok(sample)
    }
}

/// One decision waiting to be archived.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub decision: Decision,
}

/// Sending half of the bounded archive hand-off.
///
/// `submit` never waits: when the queue is full or the consumer is gone the
/// job is dropped, logged and counted. Batch callers that can afford to wait
/// use `send`, which only drops once the consumer is gone.
#[derive(Debug, Clone)]
pub struct ArchiveQueue {
    sender: mpsc::Sender<ArchiveJob>,
    dropped: Arc<AtomicU64>,
}

impl ArchiveQueue {
    /// Creates a queue and its receiving half.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ArchiveJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Hands a decision to the archive consumer. Returns false if it was dropped.
    pub fn submit(&self, decision: Decision) -> bool {
        let id = decision.id;
        match self.sender.try_send(ArchiveJob { decision }) {
            Ok(()) => true,
            Err(e) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("droptest_archive_dropped_total").increment(1);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "consumer stopped",
                };
                warn!(
                    decision_id = %id,
                    reason,
                    total_dropped = dropped,
                    "Dropped decision from training archive"
                );
                false
            }
        }
    }

    /// Hands a decision to the archive consumer, waiting for queue capacity.
    /// Returns false if the consumer has stopped.
    pub async fn send(&self, decision: Decision) -> bool {
        let id = decision.id;
        match self.sender.send(ArchiveJob { decision }).await {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("droptest_archive_dropped_total").increment(1);
                warn!(
                    decision_id = %id,
                    reason = "consumer stopped",
                    total_dropped = dropped,
                    "Dropped decision from training archive"
                );
                false
            }
        }
    }

    /// Jobs dropped so far by this queue and its clones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Starts the dedicated archive consumer.
///
/// The task drains the queue until every [`ArchiveQueue`] clone is dropped,
/// then returns the number of samples it archived. Write failures are logged
/// and counted by the collector; the consumer keeps going.
pub fn spawn_archive_consumer(
    collector: Arc<TrainingCollector>,
    capacity: usize,
) -> (ArchiveQueue, JoinHandle<u64>) {
    let (queue, mut receiver) = ArchiveQueue::bounded(capacity);

    let handle = tokio::spawn(async move {
        let mut archived = 0u64;
        while let Some(job) = receiver.recv().await {
            let features = job.decision.features.as_ref().clone();
            if collector.record(features, &job.decision).await.is_ok() {
                archived += 1;
            }
        }
        debug!(archived, "Archive consumer stopped");
        archived
    });

    (queue, handle)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{decision, features};
    use super::super::InMemorySampleStore;
    use super::*;

    fn sample_decision(verdict: Verdict) -> Decision {
        decision(&features(0.05, "plastic"), verdict, 0.9)
    }

    #[tokio::test]
    async fn test_record_and_confirm() {
        let store = Arc::new(InMemorySampleStore::new());
        let collector = TrainingCollector::new(store.clone());
        let d = sample_decision(Verdict::Pass);

        collector
            .record(d.features.as_ref().clone(), &d)
            .await
            .unwrap();
        let confirmed = collector
            .confirm(d.id, Verdict::Fail, Some("reviewer".into()))
            .await
            .unwrap();

        assert!(confirmed.was_overridden());
        let read = store.get(d.id).await.unwrap().unwrap();
        assert_eq!(read.label, Verdict::Fail);
    }

    #[tokio::test]
    async fn test_record_failure_surfaces_persistence_error() {
        let store = Arc::new(InMemorySampleStore::new());
        store.set_failing(true);
        let collector = TrainingCollector::new(store);
        let d = sample_decision(Verdict::Pass);

        let err = collector
            .record(d.features.as_ref().clone(), &d)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_consumer_drains_queue() {
        let store = Arc::new(InMemorySampleStore::new());
        let collector = Arc::new(TrainingCollector::new(store.clone()));
        let (queue, handle) = spawn_archive_consumer(collector, 8);

        for _ in 0..5 {
            assert!(queue.submit(sample_decision(Verdict::Pass)));
        }
        drop(queue);

        assert_eq!(handle.await.unwrap(), 5);
        assert_eq!(store.append_count(), 5);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (queue, _receiver) = ArchiveQueue::bounded(1);
        assert!(queue.submit(sample_decision(Verdict::Pass)));
        assert!(!queue.submit(sample_decision(Verdict::Fail)));
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_send_waits_for_capacity() {
        let store = Arc::new(InMemorySampleStore::new());
        let collector = Arc::new(TrainingCollector::new(store.clone()));
        let (queue, handle) = spawn_archive_consumer(collector, 1);

        for _ in 0..20 {
            assert!(queue.send(sample_decision(Verdict::Pass)).await);
        }
        assert_eq!(queue.dropped(), 0);
        drop(queue);

        assert_eq!(handle.await.unwrap(), 20);
        assert_eq!(store.append_count(), 20);
    }

    #[tokio::test]
    async fn test_send_to_stopped_consumer_drops() {
        let (queue, receiver) = ArchiveQueue::bounded(4);
        drop(receiver);
        assert!(!queue.send(sample_decision(Verdict::Pass)).await);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_drops() {
        let (queue, receiver) = ArchiveQueue::bounded(4);
        drop(receiver);
        assert!(!queue.submit(sample_decision(Verdict::Pass)));
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_consumer_survives_store_outage() {
        let store = Arc::new(InMemorySampleStore::new());
        store.set_failing(true);
        let collector = Arc::new(TrainingCollector::new(store.clone()));
        let (queue, handle) = spawn_archive_consumer(collector, 8);

        assert!(queue.submit(sample_decision(Verdict::Pass)));
        drop(queue);
        assert_eq!(handle.await.unwrap(), 0);
    }
}
