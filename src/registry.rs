//! Registry of the downloads that have not finished yet
//!
//! Downloads are removed once they are terminal and their destination is
//! closed. `len` and `snapshot` skip entries that are terminal but still
//! closing, while `wait_for` means "until idle, with every file on disk".

use crate::download::ClientDownload;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Default)]
struct Entries {
    downloads: Vec<Arc<ClientDownload>>,
    interrupts: u64,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<Entries>,
    changed: Condvar,
}

/// Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct DownloadRegistry {
    inner: Arc<Inner>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, download: Arc<ClientDownload>) {
        let id = download.id();
        self.inner.entries.lock().downloads.push(download.clone());
        debug!(download = id, "registered download");

        let inner = Arc::downgrade(&self.inner);
        download.on_terminal(move |d| {
            if let Some(inner) = inner.upgrade() {
                let mut entries = inner.entries.lock();
                entries.downloads.retain(|x| x.id() != d.id());
                inner.changed.notify_all();
            }
        });
    }

    /// Non-terminal downloads in registration order.
    pub fn snapshot(&self) -> Vec<Arc<ClientDownload>> {
        self.inner
            .entries
            .lock()
            .downloads
            .iter()
            .filter(|d| !d.state().is_terminal())
            .cloned()
            .collect()
    }

    /// Cancel every registered download (best-effort, errors are logged by
    /// the downloads themselves).
    pub fn cancel_all(&self) {
        let downloads = self.snapshot();
        if !downloads.is_empty() {
            debug!(count = downloads.len(), "cancelling all downloads");
        }
        for download in downloads {
            download.cancel();
        }
    }

    /// Number of non-terminal downloads.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .downloads
            .iter()
            .filter(|d| !d.state().is_terminal())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until no download is registered.
    pub fn wait_for(&self) -> Result<()> {
        let mut entries = self.inner.entries.lock();
        let seen = entries.interrupts;
        while !entries.downloads.is_empty() {
            if entries.interrupts != seen {
                return Err(Error::interrupted("waiting for downloads"));
            }
            self.inner.changed.wait(&mut entries);
        }
        Ok(())
    }

    /// Like [`wait_for`](Self::wait_for) with a bound; `Ok(false)` on timeout.
    pub fn wait_for_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.inner.entries.lock();
        let seen = entries.interrupts;
        while !entries.downloads.is_empty() {
            if entries.interrupts != seen {
                return Err(Error::interrupted("waiting for downloads"));
            }
            if self
                .inner
                .changed
                .wait_until(&mut entries, deadline)
                .timed_out()
            {
                return Ok(entries.downloads.is_empty());
            }
        }
        Ok(true)
    }

    /// Wake every current waiter with `Interrupted`.
    pub fn interrupt(&self) {
        self.inner.entries.lock().interrupts += 1;
        self.inner.changed.notify_all();
    }
}
