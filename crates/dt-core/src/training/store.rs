//! Archive store abstraction and the in-memory implementation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{apply_window, fold_entries, ArchiveEntry, Confirmation, LabeledSample};

/// Errors from the training archive. Never invalidate an emitted decision.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The backing store cannot accept writes right now.
    #[error("Archive unavailable: {0}")]
    Unavailable(String),

    /// No sample with this id has been recorded.
    #[error("Sample not found: {0}")]
    NotFound(Uuid),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored event could not be decoded.
    #[error("Corrupt archive entry at line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

/// Append-only labeled-sample archive.
///
/// Implementations must accept concurrent writers and must never rewrite
/// existing entries; confirmations are appended as new events.
#[async_trait]
pub trait SampleStore: Send + Sync + 'static {
    /// Appends a weakly labeled sample.
    async fn append(&self, sample: LabeledSample) -> Result<(), PersistenceError>;

    /// Appends a human confirmation and returns the folded sample.
    async fn confirm(&self, confirmation: Confirmation) -> Result<LabeledSample, PersistenceError>;

    /// Returns the folded sample for `id`.
    async fn get(&self, id: Uuid) -> Result<Option<LabeledSample>, PersistenceError>;

    /// Returns all samples, or the most recent `window` of them.
    async fn snapshot(&self, window: Option<usize>) -> Result<Vec<LabeledSample>, PersistenceError>;
}

/// In-memory store for tests and ephemeral runs.
///
/// Supports failure injection so callers can exercise archive outages.
#[derive(Debug, Default)]
pub struct InMemorySampleStore {
    entries: RwLock<Vec<ArchiveEntry>>,
    failing: AtomicBool,
    appends: AtomicU64,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with [`PersistenceError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful appends (recorded samples only).
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::SeqCst)
    }

    /// Number of raw log entries, including confirmations.
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable(
                "in-memory store set to fail".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn append(&self, sample: LabeledSample) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.entries.write().await.push(ArchiveEntry::Recorded(sample));
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn confirm(&self, confirmation: Confirmation) -> Result<LabeledSample, PersistenceError> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let id = confirmation.id;
        let known = entries
            .iter()
            .any(|e| matches!(e, ArchiveEntry::Recorded(s) if s.id == id));
        if !known {
            return Err(PersistenceError::NotFound(id));
        }
        entries.push(ArchiveEntry::Confirmed(confirmation));
        fold_entries(entries.iter().cloned())
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(PersistenceError::NotFound(id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<LabeledSample>, PersistenceError> {
        let entries = self.entries.read().await;
        Ok(fold_entries(entries.iter().cloned())
            .into_iter()
            .find(|s| s.id == id))
    }

    async fn snapshot(&self, window: Option<usize>) -> Result<Vec<LabeledSample>, PersistenceError> {
        let entries = self.entries.read().await;
        Ok(apply_window(fold_entries(entries.iter().cloned()), window))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::weak_sample;
    use super::*;
    use crate::decision::Verdict;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_then_confirm_reads_strong() {
        let store = InMemorySampleStore::new();
        let sample = weak_sample(0.05, Verdict::Pass);
        let id = sample.id;

        store.append(sample).await.unwrap();
        let confirmed = store
            .confirm(Confirmation::new(id, Verdict::Fail, Some("lead".into())))
            .await
            .unwrap();
        assert!(confirmed.is_strong());

        let read = store.get(id).await.unwrap().unwrap();
        assert_eq!(read.label, Verdict::Fail);
        assert!(read.is_strong());
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test]
    async fn test_confirm_unknown_id() {
        let store = InMemorySampleStore::new();
        let id = Uuid::new_v4();
        let err = store
            .confirm(Confirmation::new(id, Verdict::Pass, None))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = InMemorySampleStore::new();
        store.set_failing(true);
        let err = store
            .append(weak_sample(0.05, Verdict::Pass))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
        assert_eq!(store.append_count(), 0);

        store.set_failing(false);
        store.append(weak_sample(0.05, Verdict::Pass)).await.unwrap();
        assert_eq!(store.append_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let store = Arc::new(InMemorySampleStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append(weak_sample(i as f64 * 0.01, Verdict::Pass))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.snapshot(None).await.unwrap().len(), 16);
        assert_eq!(store.snapshot(Some(4)).await.unwrap().len(), 4);
    }
}
