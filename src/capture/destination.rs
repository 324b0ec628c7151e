//! File-backed save destination

use super::traits::{AcquireResult, SaveDestinationProvider, WritableSink};
use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Appends chunks to a file as they arrive
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl FileSink {
    /// Create (or truncate) the file at `path`
    pub async fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: Some(file),
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[async_trait]
impl WritableSink for FileSink {
    fn location(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink already closed")
        })?;
        file.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            tracing::debug!("Closed {:?} after {} bytes", self.path, self.bytes_written);
        }
        Ok(self.path.clone())
    }
}

/// Offers a timestamped file in a fixed output directory
pub struct FileDestination {
    output_dir: PathBuf,
    extension: String,
}

impl FileDestination {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            extension: "webm".to_string(),
        }
    }

    fn file_name(&self, suggested_name: &str) -> String {
        let stem: String = suggested_name
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c => c,
            })
            .collect();
        let stem = if stem.trim().is_empty() {
            "recording"
        } else {
            stem.trim()
        };
        format!(
            "{}-{}.{}",
            stem,
            Local::now().format("%Y%m%d-%H%M%S"),
            self.extension
        )
    }
}

#[async_trait]
impl SaveDestinationProvider for FileDestination {
    async fn negotiate(
        &self,
        suggested_name: &str,
    ) -> AcquireResult<Option<Box<dyn WritableSink>>> {
        let path = self.output_dir.join(self.file_name(suggested_name));
        match FileSink::create(&path).await {
            Ok(sink) => {
                tracing::info!("Recording directly to {:?}", path);
                Ok(Some(Box::new(sink)))
            }
            Err(e) => {
                tracing::warn!("Cannot write to {:?}, buffering in memory: {}", path, e);
                Ok(None)
            }
        }
    }
}
