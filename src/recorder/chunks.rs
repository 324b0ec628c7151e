//! Chunk persistence
//!
//! Chunks go to the negotiated write target while it works. The first failed
//! write switches the store to memory for the rest of the session; the
//! artifact is then the on-disk prefix followed by the in-memory tail, so its
//! byte stream still equals all chunks in arrival order.

use super::encoder::RecordingFormat;
use super::state::{ArtifactPart, RecordedArtifact};
use crate::capture::traits::WritableSink;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceMode {
    /// Every chunk so far went to disk
    DirectToDisk,
    /// Disk failed mid-session, now buffering
    Degraded,
    /// Buffering from the start
    Memory,
}

/// Where one chunk ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub sequence: u64,
    pub bytes: usize,
    pub to_disk: bool,
}

pub struct ChunkStore {
    sink: Option<Box<dyn WritableSink>>,
    write_failed: bool,
    disk_chunks: usize,
    disk_bytes: u64,
    memory: Vec<Vec<u8>>,
    sequence: u64,
}

impl ChunkStore {
    pub fn new(sink: Option<Box<dyn WritableSink>>) -> Self {
        Self {
            sink,
            write_failed: false,
            disk_chunks: 0,
            disk_bytes: 0,
            memory: Vec::new(),
            sequence: 0,
        }
    }

    pub fn mode(&self) -> PersistenceMode {
        match (&self.sink, self.write_failed) {
            (None, _) => PersistenceMode::Memory,
            (Some(_), false) => PersistenceMode::DirectToDisk,
            (Some(_), true) => PersistenceMode::Degraded,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.disk_chunks + self.memory.len()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory.iter().map(Vec::len).sum()
    }

    pub fn disk_location(&self) -> Option<&Path> {
        self.sink.as_ref().map(|s| s.location())
    }

    /// Persist one chunk. Never fails; a disk error degrades to memory.
    pub async fn push(&mut self, chunk: Vec<u8>) -> ChunkReceipt {
        let sequence = self.sequence;
        self.sequence += 1;
        let bytes = chunk.len();

        if !self.write_failed {
            if let Some(sink) = self.sink.as_mut() {
                match sink.write(&chunk).await {
                    Ok(()) => {
                        self.disk_chunks += 1;
                        self.disk_bytes += bytes as u64;
                        return ChunkReceipt {
                            sequence,
                            bytes,
                            to_disk: true,
                        };
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Write of chunk {} to {:?} failed, buffering the rest in memory: {}",
                            sequence,
                            sink.location(),
                            e
                        );
                        self.write_failed = true;
                    }
                }
            }
        }

        self.memory.push(chunk);
        ChunkReceipt {
            sequence,
            bytes,
            to_disk: false,
        }
    }

    /// Assemble everything persisted so far into an artifact.
    ///
    /// Returns None when no chunk was ever pushed, or when the only copy of
    /// the data was on a target that could not be closed.
    pub async fn finalize(
        mut self,
        duration: Duration,
        format: RecordingFormat,
    ) -> Option<RecordedArtifact> {
        let total = self.chunk_count();
        let tail = std::mem::take(&mut self.memory);
        let tail_chunks = tail.len();
        let tail_part = if tail.is_empty() {
            None
        } else {
            Some(ArtifactPart::Memory(Arc::new(tail.concat())))
        };

        let mut parts = Vec::new();

        if let Some(mut sink) = self.sink.take() {
            match sink.close().await {
                Ok(path) => {
                    if self.disk_chunks > 0 {
                        if self.write_failed {
                            truncate_to(&path, self.disk_bytes).await;
                        }
                        parts.push(ArtifactPart::File(path));
                    } else {
                        remove_empty(&path).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Closing {:?} failed, recovering {} in-memory chunk(s): {}",
                        sink.location(),
                        tail_chunks,
                        e
                    );
                }
            }
        }

        parts.extend(tail_part);

        if parts.is_empty() {
            if total > 0 {
                tracing::error!("Recorded data could not be recovered ({} chunks lost)", total);
            } else {
                tracing::info!("No chunks were recorded, no artifact produced");
            }
            return None;
        }

        tracing::info!(
            "Assembled artifact from {} chunk(s) in {} part(s)",
            total,
            parts.len()
        );
        Some(RecordedArtifact::new(parts, duration, format))
    }

    /// Close the target without producing an artifact
    pub async fn discard(mut self) {
        if let Some(mut sink) = self.sink.take() {
            match sink.close().await {
                Ok(path) if self.disk_chunks == 0 => remove_empty(&path).await,
                Ok(_) => {}
                Err(e) => tracing::debug!("Closing discarded target failed: {}", e),
            }
        }
    }
}

/// Drop any partial bytes a failed write left behind
async fn truncate_to(path: &Path, len: u64) {
    let result = async {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await
    }
    .await;

    if let Err(e) = result {
        tracing::warn!("Could not trim partial write from {:?}: {}", path, e);
    }
}

async fn remove_empty(path: &Path) {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.len() == 0 {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakySink;

    fn chunks() -> Vec<Vec<u8>> {
        (0u8..5).map(|i| vec![i; 3 + i as usize]).collect()
    }

    #[tokio::test]
    async fn test_memory_only_concatenates_in_order() {
        let mut store = ChunkStore::new(None);
        assert_eq!(store.mode(), PersistenceMode::Memory);
        for chunk in chunks() {
            let receipt = store.push(chunk).await;
            assert!(!receipt.to_disk);
        }

        let artifact = store
            .finalize(Duration::from_secs(5), RecordingFormat::Webm)
            .await
            .unwrap();
        assert_eq!(artifact.read_all().await.unwrap(), chunks().concat());
        assert!(artifact.location().is_none());
    }

    #[tokio::test]
    async fn test_direct_to_disk_yields_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink::create(dir.path().join("rec.webm")).await;
        let mut store = ChunkStore::new(Some(Box::new(sink)));

        for chunk in chunks() {
            assert!(store.push(chunk).await.to_disk);
        }

        let artifact = store
            .finalize(Duration::from_secs(5), RecordingFormat::Webm)
            .await
            .unwrap();
        assert_eq!(artifact.single_file(), Some(dir.path().join("rec.webm").as_path()));
        assert_eq!(artifact.read_all().await.unwrap(), chunks().concat());
    }

    #[tokio::test]
    async fn test_write_failure_degrades_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink::create(dir.path().join("rec.webm"))
            .await
            .fail_on_write(3);
        let mut store = ChunkStore::new(Some(Box::new(sink)));

        let mut receipts = Vec::new();
        for chunk in chunks() {
            receipts.push(store.push(chunk).await);
        }
        assert_eq!(store.mode(), PersistenceMode::Degraded);
        assert!(receipts[1].to_disk);
        assert!(!receipts[2].to_disk);
        // later chunks never retry the disk
        assert!(!receipts[3].to_disk);
        assert_eq!(receipts[4].sequence, 4);

        let artifact = store
            .finalize(Duration::from_secs(5), RecordingFormat::Webm)
            .await
            .unwrap();
        assert_eq!(artifact.parts().len(), 2);
        assert_eq!(artifact.read_all().await.unwrap(), chunks().concat());
    }

    #[tokio::test]
    async fn test_close_failure_recovers_memory_tail() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink::create(dir.path().join("rec.webm"))
            .await
            .fail_on_write(2)
            .fail_close();
        let mut store = ChunkStore::new(Some(Box::new(sink)));
        for chunk in chunks() {
            store.push(chunk).await;
        }

        let artifact = store
            .finalize(Duration::from_secs(5), RecordingFormat::Webm)
            .await
            .unwrap();
        assert_eq!(artifact.read_all().await.unwrap(), chunks()[1..].concat());
    }

    #[tokio::test]
    async fn test_close_failure_without_memory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink::create(dir.path().join("rec.webm")).await.fail_close();
        let mut store = ChunkStore::new(Some(Box::new(sink)));
        store.push(vec![1, 2, 3]).await;

        assert!(store
            .finalize(Duration::from_secs(1), RecordingFormat::Webm)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_no_chunks_no_artifact() {
        let store = ChunkStore::new(None);
        assert!(store
            .finalize(Duration::ZERO, RecordingFormat::Webm)
            .await
            .is_none());
    }
}
