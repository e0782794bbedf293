//! File-backed archive: one JSON-encoded [`ArchiveEntry`] per line.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::{PersistenceError, SampleStore};
use super::{apply_window, fold_entries, ArchiveEntry, Confirmation, LabeledSample};

/// Read size used when scanning back for the last complete line.
const TAIL_CHUNK: usize = 4096;

/// Append-only JSONL archive.
///
/// Writers within one process are serialised by an async mutex so lines never
/// interleave. A trailing line without a newline is treated as an interrupted
/// write: reads skip it and the next write truncates it away.
#[derive(Debug)]
pub struct JsonlSampleStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSampleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_entry(&self, entry: &ArchiveEntry) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        let end = self.repair_tail(&mut file).await?;
        file.seek(SeekFrom::Start(end)).await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Drops an interrupted trailing entry and returns the new file length.
    async fn repair_tail(&self, file: &mut File) -> Result<u64, PersistenceError> {
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(0);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(len);
        }

        let mut keep = 0;
        let mut end = len;
        let mut chunk = vec![0u8; TAIL_CHUNK];
        while end > 0 {
            let start = end.saturating_sub(TAIL_CHUNK as u64);
            let size = (end - start) as usize;
            file.seek(SeekFrom::Start(start)).await?;
            file.read_exact(&mut chunk[..size]).await?;
            if let Some(pos) = chunk[..size].iter().rposition(|b| *b == b'\n') {
                keep = start + pos as u64 + 1;
                break;
            }
            end = start;
        }

        warn!(
            path = %self.path.display(),
            dropped_bytes = len - keep,
            "Truncating interrupted trailing archive entry"
        );
        file.set_len(keep).await?;
        Ok(keep)
    }

    async fn read_entries(&self) -> Result<Vec<ArchiveEntry>, PersistenceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let complete = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();
        let mut entries = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArchiveEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if !complete && i + 1 == lines.len() => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Skipping truncated trailing archive entry"
                    );
                }
                Err(e) => {
                    return Err(PersistenceError::Corrupt {
                        line: i + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl SampleStore for JsonlSampleStore {
    async fn append(&self, sample: LabeledSample) -> Result<(), PersistenceError> {
        let id = sample.id;
        let _guard = self.write_lock.lock().await;
        self.write_entry(&ArchiveEntry::Recorded(sample)).await?;
        debug!(sample_id = %id, "Archived sample");
        Ok(())
    }

    async fn confirm(&self, confirmation: Confirmation) -> Result<LabeledSample, PersistenceError> {
        let id = confirmation.id;
        let _guard = self.write_lock.lock().await;

        let mut entries = self.read_entries().await?;
        let known = entries
            .iter()
            .any(|e| matches!(e, ArchiveEntry::Recorded(s) if s.id == id));
        if !known {
            return Err(PersistenceError::NotFound(id));
        }

        let entry = ArchiveEntry::Confirmed(confirmation);
        self.write_entry(&entry).await?;
        entries.push(entry);
        fold_entries(entries)
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(PersistenceError::NotFound(id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<LabeledSample>, PersistenceError> {
        Ok(fold_entries(self.read_entries().await?)
            .into_iter()
            .find(|s| s.id == id))
    }

    async fn snapshot(&self, window: Option<usize>) -> Result<Vec<LabeledSample>, PersistenceError> {
        Ok(apply_window(fold_entries(self.read_entries().await?), window))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::weak_sample;
    use super::*;
    use crate::decision::Verdict;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_is_empty_archive() {
        let dir = tempdir().unwrap();
        let store = JsonlSampleStore::new(dir.path().join("archive.jsonl"));
        assert!(store.snapshot(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        let sample = weak_sample(0.12, Verdict::Fail);
        let id = sample.id;

        {
            let store = JsonlSampleStore::new(&path);
            store.append(sample.clone()).await.unwrap();
            store
                .confirm(Confirmation::new(id, Verdict::Pass, Some("qa-lead".into())))
                .await
                .unwrap();
            // Redelivery of the original record.
            store.append(sample).await.unwrap();
        }

        let reopened = JsonlSampleStore::new(&path);
        let read = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(read.label, Verdict::Pass);
        assert!(read.is_strong());
        assert_eq!(reopened.snapshot(None).await.unwrap().len(), 1);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_truncated_tail_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        let store = JsonlSampleStore::new(&path);
        store.append(weak_sample(0.05, Verdict::Pass)).await.unwrap();

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str(r#"{"event":"recorded","id":"#);
        std::fs::write(&path, raw).unwrap();

        assert_eq!(store.snapshot(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_after_truncated_tail_keeps_archive_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        let store = JsonlSampleStore::new(&path);
        let first = weak_sample(0.05, Verdict::Pass);
        store.append(first.clone()).await.unwrap();

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str(r#"{"event":"recorded","id":"#);
        std::fs::write(&path, raw).unwrap();

        let second = weak_sample(0.2, Verdict::Fail);
        store.append(second.clone()).await.unwrap();
        store
            .confirm(Confirmation::new(first.id, Verdict::Fail, None))
            .await
            .unwrap();

        let samples = store.snapshot(None).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert!(store.get(second.id).await.unwrap().is_some());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_tail_without_any_newline_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        std::fs::write(&path, r#"{"event":"rec"#).unwrap();

        let store = JsonlSampleStore::new(&path);
        store.append(weak_sample(0.05, Verdict::Pass)).await.unwrap();

        assert_eq!(store.snapshot(None).await.unwrap().len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_interior_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let store = JsonlSampleStore::new(&path);
        let err = store.snapshot(None).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn test_confirm_unknown_id_does_not_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        let store = JsonlSampleStore::new(&path);

        let err = store
            .confirm(Confirmation::new(Uuid::new_v4(), Verdict::Pass, None))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
        assert!(!path.exists());
    }
}
