//! Periodic snapshot recording to disk

use crate::{ExportFormat, Result, StatsSnapshot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Appends snapshots to a file in the format implied by its extension
pub struct StatsRecorder {
    file_path: PathBuf,
    format: ExportFormat,
    writer: Option<BufWriter<File>>,
    entries_recorded: u64,
}

impl StatsRecorder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let file_path = path.as_ref().to_path_buf();
        Self {
            format: ExportFormat::from_path(&file_path),
            file_path,
            writer: None,
            entries_recorded: 0,
        }
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    /// Create (truncate) the output file
    pub async fn initialize(&mut self) -> Result<()> {
        let file = File::create(&self.file_path).await?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Append one snapshot
    pub async fn record<C: Serialize>(&mut self, snapshot: &StatsSnapshot<C>) -> Result<()> {
        if self.writer.is_none() {
            self.initialize().await?;
        }

        let encoded = self.format.encode(snapshot, self.entries_recorded == 0)?;
        if let Some(ref mut writer) = self.writer {
            writer.write_all(encoded.as_bytes()).await?;
            writer.flush().await?;
            self.entries_recorded += 1;
        }
        Ok(())
    }

    pub fn entries_recorded(&self) -> u64 {
        self.entries_recorded
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        Ok(())
    }

    /// Record a snapshot from `source` every `interval` until the handle is stopped
    pub fn spawn<C, F>(mut self, interval: Duration, source: F) -> RecorderHandle
    where
        C: Serialize + Send + Sync + 'static,
        F: Fn() -> StatsSnapshot<C> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        info!(path = %self.file_path.display(), ?interval, "Recording stats snapshots");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = source();
                        if let Err(e) = self.record(&snapshot).await {
                            warn!("Failed to record stats snapshot: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Stats recorder shutting down");
                        break;
                    }
                }
            }
            if let Err(e) = self.close().await {
                warn!("Failed to flush stats recording: {}", e);
            }
            self.entries_recorded
        });

        RecorderHandle {
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

/// Control handle for a spawned [`StatsRecorder`]
#[derive(Debug)]
pub struct RecorderHandle {
    handle: Option<JoinHandle<u64>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl RecorderHandle {
    /// Stop recording, flush, and return the number of snapshots written
    pub async fn stop(mut self) -> u64 {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for RecorderHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
