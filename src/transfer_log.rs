use crate::download::{ClientDownload, DownloadListener, DownloadState};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    fn from_state(state: DownloadState) -> Option<Self> {
        match state {
            DownloadState::Complete => Some(TransferStatus::Completed),
            DownloadState::Cancelled => Some(TransferStatus::Cancelled),
            DownloadState::Error => Some(TransferStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub download_id: u64,
    pub url: String,
    pub target: PathBuf,
    pub status: TransferStatus,
    pub length: Option<u64>,
    pub bytes_received: u64,
    pub bytes_written: u64,
    pub error: Option<String>,
}

/// Append-only JSONL journal of finished downloads.
pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TransferLog {
            log_file_path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .with_context(|| format!("open transfer log {}", self.log_file_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Download listener that journals the download once it ends.
    pub fn recorder(
        self: &Arc<Self>,
        url: impl Into<String>,
        target: impl Into<PathBuf>,
    ) -> Arc<dyn DownloadListener> {
        Arc::new(Recorder {
            log: self.clone(),
            url: url.into(),
            target: target.into(),
        })
    }
}

struct Recorder {
    log: Arc<TransferLog>,
    url: String,
    target: PathBuf,
}

impl DownloadListener for Recorder {
    fn state_changed(&self, download: &ClientDownload, state: DownloadState) {
        let Some(status) = TransferStatus::from_state(state) else {
            return;
        };
        let error = download
            .break_off_message()
            .or_else(|| download.error().map(|e| e.to_string()));
        let entry = TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            download_id: download.id(),
            url: self.url.clone(),
            target: self.target.clone(),
            status,
            length: download.length(),
            bytes_received: download.bytes_received(),
            bytes_written: download.bytes_written(),
            error,
        };
        if let Err(e) = self.log.add_entry(&entry) {
            warn!("could not write transfer log: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use crate::packet::DownloadPacket;
    use crate::queue::QueuePolicy;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn terminal_downloads_are_journaled_once() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(TransferLog::new(dir.path().join("transfers.jsonl")));
        assert!(log.read_log().unwrap().is_empty());

        let channel = MemoryChannel::new(1);
        let download = ClientDownload::new(
            5,
            channel.clone(),
            Box::new(std::io::sink()),
            Some(3),
            QueuePolicy::Unbounded,
        );
        download.add_listener(log.recorder("bnj://host/a.bin", dir.path().join("a.bin")));
        download.start().unwrap();
        channel.inject(DownloadPacket::Data(vec![1, 2, 3]));
        channel.inject(DownloadPacket::Finish);
        assert_eq!(
            download.wait_terminal(Duration::from_secs(5)),
            DownloadState::Complete
        );
        download.join();

        let entries = log.read_log().unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.download_id, 5);
        assert_eq!(e.status, TransferStatus::Completed);
        assert_eq!(e.bytes_written, 3);
        assert_eq!(e.url, "bnj://host/a.bin");
        assert!(e.error.is_none());
    }

    #[test]
    fn peer_cancel_reason_is_recorded() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(TransferLog::new(dir.path().join("transfers.jsonl")));
        let channel = MemoryChannel::new(2);
        let download = ClientDownload::new(
            6,
            channel.clone(),
            Box::new(std::io::sink()),
            None,
            QueuePolicy::Unbounded,
        );
        download.add_listener(log.recorder("bnj://host/b.bin", dir.path().join("b.bin")));
        download.start().unwrap();
        channel.inject(DownloadPacket::cancel_with("quota exceeded"));
        download.join();

        let entries = log.read_log().unwrap();
        assert_eq!(entries[0].status, TransferStatus::Failed);
        assert_eq!(entries[0].error.as_deref(), Some("quota exceeded"));
    }
}
