//! Turns an opened download channel into a running `ClientDownload`
//!
//! Header negotiation, target resolution (prompting when the caller left
//! it open), destination opening, registration.

use crate::channel::DownloadChannel;
use crate::download::ClientDownload;
use crate::error::Result;
use crate::metadata::{IdAllocator, TransferMetadata};
use crate::packet::{DownloadPacket, Header};
use crate::queue::QueuePolicy;
use crate::registry::DownloadRegistry;
use crate::request::HeaderRequest;
use crate::target::{open_target, resolve_target, sanitize_file_name};
use crate::transfer_log::TransferLog;
use crate::ui::TargetPrompt;
use parking_lot::Mutex;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    prompt: Arc<dyn TargetPrompt>,
    registry: DownloadRegistry,
    ids: IdAllocator,
    header_timeout: Duration,
    queue_policy: QueuePolicy,
    transfer_log: Option<Arc<TransferLog>>,
    /// Header requests currently blocking a caller
    pending: Mutex<Vec<Weak<HeaderRequest>>>,
}

impl Orchestrator {
    pub fn new(
        prompt: Arc<dyn TargetPrompt>,
        header_timeout: Duration,
        queue_policy: QueuePolicy,
    ) -> Self {
        Self {
            prompt,
            registry: DownloadRegistry::new(),
            ids: IdAllocator::new(),
            header_timeout,
            queue_policy,
            transfer_log: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_transfer_log(mut self, log: Arc<TransferLog>) -> Self {
        self.transfer_log = Some(log);
        self
    }

    pub fn registry(&self) -> &DownloadRegistry {
        &self.registry
    }

    pub fn new_metadata(&self, url: impl Into<String>) -> TransferMetadata {
        TransferMetadata::new(&self.ids, url)
    }

    fn request_header(
        &self,
        metadata: &TransferMetadata,
        channel: &DownloadChannel,
    ) -> Result<Header> {
        let request = Arc::new(HeaderRequest::new(channel.clone(), metadata.url()));
        self.pending.lock().push(Arc::downgrade(&request));
        let result = request.request(self.header_timeout);
        drop(request);
        self.pending.lock().retain(|r| r.strong_count() > 0);
        result
    }

    /// Negotiate the header and build the download.
    ///
    /// `Ok(None)` means the caller declined to choose a target.
    pub fn request_download_from(
        &self,
        metadata: &mut TransferMetadata,
        channel: &DownloadChannel,
    ) -> Result<Option<Arc<ClientDownload>>> {
        let header = match self.request_header(metadata, channel) {
            Ok(header) => header,
            Err(e) => {
                if let Err(send_err) = channel.send(DownloadPacket::cancel_with(e.to_string())) {
                    debug!(channel = channel.id(), "cancel not sent: {}", send_err);
                }
                return Err(e);
            }
        };
        debug!(
            download = metadata.id(),
            length = ?header.length,
            name = %header.file_name,
            "header received"
        );

        metadata.length = header.length;
        if !metadata.has_file_name() {
            metadata.file_name = sanitize_file_name(&header.file_name);
        }
        if !metadata.is_target_specified() {
            self.prompt.prompt_for_target(metadata);
            if !metadata.is_target_specified() {
                info!(download = metadata.id(), "no target chosen, download declined");
                return Ok(None);
            }
        }

        let (dir, name) = match (&metadata.target_directory, &metadata.file_name) {
            (Some(dir), Some(name)) => (dir.clone(), name.trim().to_string()),
            _ => return Ok(None),
        };
        let path: PathBuf = resolve_target(&dir, &name)?;
        let file = open_target(&path)?;

        let download = ClientDownload::new(
            metadata.id(),
            channel.clone(),
            Box::new(BufWriter::new(file)),
            metadata.length,
            self.queue_policy,
        );
        if let Some(log) = &self.transfer_log {
            download.add_listener(log.recorder(metadata.url(), &path));
        }
        self.registry.add(download.clone());
        info!(download = metadata.id(), target = %path.display(), "download prepared");
        Ok(Some(download))
    }

    /// Start the writer, then tell the server to send data.
    pub fn start_download(
        &self,
        channel: &DownloadChannel,
        download: &Arc<ClientDownload>,
    ) -> Result<()> {
        download.start()?;
        if let Err(e) = channel.send(DownloadPacket::Ready) {
            warn!(download = download.id(), "could not send ready: {}", e);
            download.cancel();
            return Err(e);
        }
        Ok(())
    }

    pub fn cancel_downloads(&self) {
        self.registry.cancel_all();
    }

    pub fn wait_for_downloads(&self) -> Result<()> {
        self.registry.wait_for()
    }

    pub fn active_download_count(&self) -> usize {
        self.registry.len()
    }

    /// Shutdown: cancel everything and release callers stuck on a header.
    pub fn close(&self) {
        self.cancel_downloads();
        let pending: Vec<_> = self.pending.lock().iter().filter_map(Weak::upgrade).collect();
        for request in pending {
            request.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use crate::channel::Channel;
    use crate::download::DownloadState;
    use crate::error::Error;
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;

    /// Prompt that fills in a fixed directory, or declines.
    struct FixedPrompt {
        dir: Option<PathBuf>,
        asked: Mutex<u32>,
    }

    impl TargetPrompt for FixedPrompt {
        fn prompt_for_target(&self, metadata: &mut TransferMetadata) {
            *self.asked.lock() += 1;
            if let Some(dir) = &self.dir {
                metadata.target_directory = Some(dir.clone());
            }
        }
    }

    fn orchestrator(dir: Option<&Path>) -> (Orchestrator, Arc<FixedPrompt>) {
        let prompt = Arc::new(FixedPrompt {
            dir: dir.map(Path::to_path_buf),
            asked: Mutex::new(0),
        });
        let o = Orchestrator::new(
            prompt.clone(),
            Duration::from_millis(200),
            QueuePolicy::Bounded(16),
        );
        (o, prompt)
    }

    fn serving(name: &str, length: Option<u64>) -> Arc<MemoryChannel<DownloadPacket>> {
        let channel = MemoryChannel::new(1);
        let name = name.to_string();
        channel.respond_with(move |p| match p {
            DownloadPacket::Request { .. } => Some(DownloadPacket::Header(Header {
                length,
                file_name: name.clone(),
            })),
            _ => None,
        });
        channel
    }

    #[test]
    fn header_name_is_adopted_and_target_opened() {
        let dir = TempDir::new().unwrap();
        let (o, prompt) = orchestrator(Some(dir.path()));
        let channel = serving("file.bin", Some(1024));
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o.new_metadata("http://x/file.bin");
        let download = o.request_download_from(&mut metadata, &dc).unwrap().unwrap();

        assert_eq!(metadata.file_name.as_deref(), Some("file.bin"));
        assert_eq!(metadata.length, Some(1024));
        assert_eq!(*prompt.asked.lock(), 1);
        assert!(dir.path().join("file.bin").exists());
        assert_eq!(o.active_download_count(), 1);
        assert_eq!(download.state(), DownloadState::Pending);

        o.start_download(&dc, &download).unwrap();
        assert_eq!(channel.sent().last(), Some(&DownloadPacket::Ready));
        o.cancel_downloads();
        download.join();
        assert_eq!(o.active_download_count(), 0);
    }

    #[test]
    fn caller_supplied_target_skips_prompt_and_keeps_name() {
        let dir = TempDir::new().unwrap();
        let (o, prompt) = orchestrator(None);
        let channel = serving("server-name.bin", None);
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o
            .new_metadata("http://x/a")
            .with_target_directory(dir.path())
            .with_file_name("mine.bin");
        let download = o.request_download_from(&mut metadata, &dc).unwrap().unwrap();

        assert_eq!(*prompt.asked.lock(), 0);
        assert_eq!(metadata.file_name.as_deref(), Some("mine.bin"));
        assert!(dir.path().join("mine.bin").exists());
        download.cancel();
    }

    #[test]
    fn traversal_in_suggested_name_stays_inside_directory() {
        let dir = TempDir::new().unwrap();
        let (o, _prompt) = orchestrator(Some(dir.path()));
        let channel = serving("../../escape.bin", None);
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o.new_metadata("http://x/e");
        let download = o.request_download_from(&mut metadata, &dc).unwrap().unwrap();
        assert!(dir.path().join("escape.bin").exists());
        download.cancel();
    }

    #[test]
    fn declined_prompt_yields_no_download() {
        let (o, prompt) = orchestrator(None);
        let channel = serving("file.bin", Some(1));
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o.new_metadata("http://x/file.bin");
        assert!(o.request_download_from(&mut metadata, &dc).unwrap().is_none());
        assert_eq!(*prompt.asked.lock(), 1);
        assert_eq!(o.active_download_count(), 0);
    }

    #[test]
    fn header_timeout_sends_cancel_with_reason() {
        let dir = TempDir::new().unwrap();
        let (o, _prompt) = orchestrator(Some(dir.path()));
        let channel = MemoryChannel::new(3);
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o.new_metadata("http://x/slow");
        let err = o.request_download_from(&mut metadata, &dc).unwrap_err();
        assert!(err.is_timeout());
        match channel.sent().last() {
            Some(DownloadPacket::Cancel { message: Some(m) }) => assert!(m.contains("timed out")),
            other => panic!("expected cancel, got {:?}", other),
        }
        assert_eq!(channel.listener_count(), 0);
        assert_eq!(o.active_download_count(), 0);
    }

    #[test]
    fn unopenable_target_is_inaccessible() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let (o, _prompt) = orchestrator(Some(&missing));
        let channel = serving("file.bin", None);
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o.new_metadata("http://x/file.bin");
        assert!(matches!(
            o.request_download_from(&mut metadata, &dc),
            Err(Error::TargetInaccessible { .. })
        ));
        assert_eq!(o.active_download_count(), 0);
    }

    #[test]
    fn name_with_directories_is_inaccessible() {
        let dir = TempDir::new().unwrap();
        let (o, _prompt) = orchestrator(None);
        let channel = serving("file.bin", None);
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o
            .new_metadata("http://x/file.bin")
            .with_target_directory(dir.path())
            .with_file_name("sub/file.bin");
        match o.request_download_from(&mut metadata, &dc) {
            Err(Error::TargetInaccessible { path, .. }) => {
                assert_eq!(path, dir.path().join("sub/file.bin"))
            }
            other => panic!("unexpected {:?}", other.map(|d| d.map(|d| d.id()))),
        }
        assert!(!dir.path().join("sub").exists());
        assert_eq!(o.active_download_count(), 0);
    }

    #[test]
    fn failed_ready_cancels_the_download() {
        let dir = TempDir::new().unwrap();
        let (o, _prompt) = orchestrator(Some(dir.path()));
        let channel = serving("file.bin", None);
        let dc: DownloadChannel = channel.clone();

        let mut metadata = o.new_metadata("http://x/file.bin");
        let download = o.request_download_from(&mut metadata, &dc).unwrap().unwrap();
        channel.fail_sends(true);
        assert!(o.start_download(&dc, &download).is_err());
        download.join();
        assert_eq!(download.state(), DownloadState::Cancelled);
        assert_eq!(o.active_download_count(), 0);
    }

    #[test]
    fn close_interrupts_a_pending_header_request() {
        let prompt = Arc::new(FixedPrompt {
            dir: None,
            asked: Mutex::new(0),
        });
        let o = Arc::new(Orchestrator::new(
            prompt,
            Duration::from_secs(30),
            QueuePolicy::Unbounded,
        ));
        let channel = MemoryChannel::new(4);
        let dc: DownloadChannel = channel.clone();

        let o2 = o.clone();
        let waiter = thread::spawn(move || {
            let mut metadata = o2.new_metadata("http://x/never");
            o2.request_download_from(&mut metadata, &dc).map(|d| d.is_some())
        });
        thread::sleep(Duration::from_millis(100));
        o.close();
        assert!(waiter.join().unwrap().unwrap_err().is_interrupted());
    }
}
