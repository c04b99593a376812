//! One transfer: consumes download packets from its channel and turns them
//! into disk writes on a dedicated writer thread.
//!
//! ```text
//! Pending --start--> Running --Finish--> LoadingFinished --drained--> Complete
//!                       |                       |
//!                       +-----------------------+--> Cancelled (local cancel)
//!                                               +--> Error (peer cancel, write failure, channel lost)
//! ```
//!
//! Once terminal the state never changes again. The network thread only
//! ever enqueues; all disk work happens on the writer. `Complete` is entered
//! only after the destination is flushed and closed, and terminal hooks wait
//! for the destination to be released whatever the terminal state.

use crate::channel::{ChannelListener, DownloadChannel, ListenerId};
use crate::error::{Error, Result};
use crate::packet::DownloadPacket;
use crate::protocol::WRITE_SLICE;
use crate::queue::{CancelToken, HandoffQueue, QueuePolicy};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DownloadState {
    /// Built, writer not started yet
    Pending,
    Running,
    /// Server sent Finish; queued payloads are still being written
    LoadingFinished,
    Complete,
    Cancelled,
    Error,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Complete | DownloadState::Cancelled | DownloadState::Error
        )
    }

    fn can_move_to(self, next: DownloadState) -> bool {
        use DownloadState::*;
        match self {
            Pending => matches!(next, Running | Cancelled | Error),
            Running => matches!(next, LoadingFinished | Complete | Cancelled | Error),
            LoadingFinished => matches!(next, Complete | Cancelled | Error),
            Complete | Cancelled | Error => false,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::Pending => "pending",
            DownloadState::Running => "running",
            DownloadState::LoadingFinished => "loading finished",
            DownloadState::Complete => "complete",
            DownloadState::Cancelled => "cancelled",
            DownloadState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Per-download notifications for the presentation layer.
///
/// Called from the connection read thread and from the writer thread; keep
/// implementations short.
pub trait DownloadListener: Send + Sync {
    fn state_changed(&self, _download: &ClientDownload, _state: DownloadState) {}

    /// Bytes were written to the destination.
    fn progress(&self, _download: &ClientDownload) {}

    /// The download entered `Error`; `message` is the break-off reason or
    /// the write failure.
    fn failed(&self, _download: &ClientDownload, _message: &str) {}
}

type TerminalHook = Box<dyn FnOnce(&ClientDownload) + Send>;

struct Lifecycle {
    state: DownloadState,
    output_closed: bool,
    terminal_hooks: Vec<TerminalHook>,
}

impl Lifecycle {
    /// Hooks are due once the state is terminal and the destination released.
    fn take_due_hooks(&mut self) -> Vec<TerminalHook> {
        if self.state.is_terminal() && self.output_closed {
            std::mem::take(&mut self.terminal_hooks)
        } else {
            Vec::new()
        }
    }
}

pub struct ClientDownload {
    id: u64,
    channel: DownloadChannel,
    listener_id: Mutex<Option<ListenerId>>,

    lifecycle: Mutex<Lifecycle>,
    state_changed: Condvar,

    length: Mutex<Option<u64>>,
    received: AtomicU64,
    written: AtomicU64,

    queue: HandoffQueue,
    cancel: CancelToken,
    output: Mutex<Option<Box<dyn Write + Send>>>,
    writer: Mutex<Option<JoinHandle<()>>>,

    error: Mutex<Option<Arc<Error>>>,
    break_off: Mutex<Option<String>>,
    listeners: Mutex<Vec<Arc<dyn DownloadListener>>>,
}

impl ClientDownload {
    /// Build the entity and start listening on `channel`. The writer does not
    /// run until [`start`](Self::start).
    pub fn new(
        id: u64,
        channel: DownloadChannel,
        output: Box<dyn Write + Send>,
        length: Option<u64>,
        policy: QueuePolicy,
    ) -> Arc<Self> {
        let download = Arc::new(Self {
            id,
            channel: channel.clone(),
            listener_id: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: DownloadState::Pending,
                output_closed: false,
                terminal_hooks: Vec::new(),
            }),
            state_changed: Condvar::new(),
            length: Mutex::new(length),
            received: AtomicU64::new(0),
            written: AtomicU64::new(0),
            queue: HandoffQueue::new(policy),
            cancel: CancelToken::new(),
            output: Mutex::new(Some(output)),
            writer: Mutex::new(None),
            error: Mutex::new(None),
            break_off: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        });
        let lid = channel.add_listener(download.clone());
        *download.listener_id.lock() = Some(lid);
        download
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel_id(&self) -> u32 {
        self.channel.id()
    }

    pub fn state(&self) -> DownloadState {
        self.lifecycle.lock().state
    }

    pub fn length(&self) -> Option<u64> {
        *self.length.lock()
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// Bytes written and flushed to the destination.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.error.lock().clone()
    }

    pub fn break_off_message(&self) -> Option<String> {
        self.break_off.lock().clone()
    }

    /// Destination has been flushed (best-effort when stopping) and dropped.
    pub fn is_output_closed(&self) -> bool {
        self.lifecycle.lock().output_closed
    }

    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.listeners.lock().push(listener);
    }

    /// Run `hook` once the download is terminal and its destination closed
    /// (immediately if both already hold).
    pub fn on_terminal(&self, hook: impl FnOnce(&ClientDownload) + Send + 'static) {
        {
            let mut lc = self.lifecycle.lock();
            if !(lc.state.is_terminal() && lc.output_closed) {
                lc.terminal_hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self);
    }

    /// Enter `Running` and spawn the writer thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Ok(());
        }
        if !self.transition(DownloadState::Running) {
            // Stopped before it started; the output was released on that transition
            return Ok(());
        }
        let this = self.clone();
        let handle = thread::Builder::new()
            .name(format!("download-{}", self.id))
            .spawn(move || this.run())?;
        *writer = Some(handle);
        Ok(())
    }

    /// Cancel locally: stop the writer promptly and tell the peer.
    ///
    /// Returns false when the download already reached a terminal state.
    pub fn cancel(&self) -> bool {
        debug!(download = self.id, "cancelling download");
        self.transition_with(DownloadState::Cancelled, Some(DownloadPacket::cancel()))
    }

    /// Block until terminal or `timeout`; returns the state observed last.
    pub fn wait_terminal(&self, timeout: Duration) -> DownloadState {
        let deadline = Instant::now() + timeout;
        let mut lc = self.lifecycle.lock();
        while !lc.state.is_terminal() {
            if self.state_changed.wait_until(&mut lc, deadline).timed_out() {
                break;
            }
        }
        lc.state
    }

    /// Wait for the writer thread to exit.
    pub fn join(&self) {
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(download = self.id, "writer thread panicked");
            }
        }
    }

    fn transition(&self, next: DownloadState) -> bool {
        self.transition_with(next, None)
    }

    /// Apply a state change if the state machine allows it. `farewell` goes
    /// to the peer (best-effort) before listeners and terminal hooks run.
    ///
    /// Terminal hooks run here only when the destination is already closed;
    /// otherwise the writer runs them once it lets go of the destination.
    fn transition_with(&self, next: DownloadState, farewell: Option<DownloadPacket>) -> bool {
        let (from, hooks) = {
            let mut lc = self.lifecycle.lock();
            if !lc.state.can_move_to(next) {
                return false;
            }
            debug!(download = self.id, from = %lc.state, to = %next, "state change");
            let from = std::mem::replace(&mut lc.state, next);
            self.state_changed.notify_all();
            (from, lc.take_due_hooks())
        };

        if matches!(next, DownloadState::Cancelled | DownloadState::Error) {
            self.cancel.cancel();
        }
        if next != DownloadState::Running {
            self.queue.wake();
        }
        if let Some(packet) = farewell {
            if let Err(e) = self.channel.send(packet) {
                // The connection may already be gone
                debug!(download = self.id, "could not send cancel packet: {}", e);
            }
        }

        for listener in self.listener_snapshot() {
            listener.state_changed(self, next);
        }

        if next.is_terminal() {
            if let Some(lid) = self.listener_id.lock().take() {
                self.channel.remove_listener(lid);
            }
            if from == DownloadState::Pending {
                // No writer will ever run
                if let Err(e) = self.close_output() {
                    warn!(download = self.id, "could not flush unused download target: {}", e);
                }
            }
            self.run_hooks(hooks);
        }
        true
    }

    fn run_hooks(&self, hooks: Vec<TerminalHook>) {
        for hook in hooks {
            hook(self);
        }
    }

    fn fail(&self, message: String, farewell: Option<DownloadPacket>) {
        if self.transition_with(DownloadState::Error, farewell) {
            for listener in self.listener_snapshot() {
                listener.failed(self, &message);
            }
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn DownloadListener>> {
        self.listeners.lock().clone()
    }

    fn keep_writing(&self) -> bool {
        match self.state() {
            DownloadState::Running => true,
            DownloadState::LoadingFinished => !self.queue.is_empty(),
            _ => false,
        }
    }

    /// Writer loop, runs on its own thread.
    fn run(self: Arc<Self>) {
        while self.keep_writing() {
            let Some(bytes) = self.queue.take(&self.cancel) else {
                continue;
            };
            if let Err(e) = self.write_payload(&bytes) {
                self.write_failed(e);
            }
        }

        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(download = self.id, dropped, "discarded queued payloads");
        }

        if self.state() == DownloadState::LoadingFinished {
            match self.close_output() {
                Ok(()) => {
                    if self.transition(DownloadState::Complete) {
                        info!(download = self.id, bytes = self.bytes_written(), "download complete");
                    }
                }
                Err(e) => self.write_failed(e),
            }
        } else if let Err(e) = self.close_output() {
            warn!(download = self.id, "could not flush download target: {}", e);
        }
    }

    fn write_failed(&self, e: io::Error) {
        error!(download = self.id, "error while downloading: {}", e);
        let message = e.to_string();
        *self.error.lock() = Some(Arc::new(Error::Io(e)));
        self.fail(message.clone(), Some(DownloadPacket::cancel_with(message)));
    }

    /// Write one payload in slices, stopping early on cancellation, then
    /// flush it. Only flushed bytes count as written.
    fn write_payload(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.output.lock();
        let Some(out) = guard.as_mut() else {
            return Ok(());
        };
        let mut pending = 0u64;
        for slice in bytes.chunks(WRITE_SLICE) {
            if self.cancel.is_cancelled() {
                break;
            }
            out.write_all(slice)?;
            pending += slice.len() as u64;
        }
        out.flush()?;
        self.written.fetch_add(pending, Ordering::SeqCst);
        drop(guard);
        for listener in self.listener_snapshot() {
            listener.progress(self);
        }
        Ok(())
    }

    /// Flush and drop the destination, then run any terminal hooks that were
    /// waiting for it. Idempotent; only the first call can report an error.
    fn close_output(&self) -> io::Result<()> {
        let flushed = match self.output.lock().take() {
            Some(mut out) => out.flush(),
            None => Ok(()),
        };
        let hooks = {
            let mut lc = self.lifecycle.lock();
            lc.output_closed = true;
            self.state_changed.notify_all();
            lc.take_due_hooks()
        };
        self.run_hooks(hooks);
        flushed
    }

    /// Block until the destination is closed or `timeout` passes.
    pub fn wait_output_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lc = self.lifecycle.lock();
        while !lc.output_closed {
            if self.state_changed.wait_until(&mut lc, deadline).timed_out() {
                return lc.output_closed;
            }
        }
        true
    }
}

impl ChannelListener<DownloadPacket> for ClientDownload {
    fn received(&self, packet: DownloadPacket) {
        match packet {
            DownloadPacket::Header(header) => {
                *self.length.lock() = header.length;
            }
            DownloadPacket::Data(bytes) => {
                if self.state().is_terminal() {
                    return;
                }
                self.received.fetch_add(bytes.len() as u64, Ordering::SeqCst);
                if !self.queue.put(bytes, &self.cancel) {
                    debug!(download = self.id, "payload dropped, download is stopping");
                }
            }
            DownloadPacket::Finish => {
                debug!(download = self.id, "server finished sending");
                self.transition(DownloadState::LoadingFinished);
            }
            DownloadPacket::Cancel { message } => {
                if self.state().is_terminal() {
                    return;
                }
                let reason = message.unwrap_or_else(|| "no reason given".to_string());
                error!(download = self.id, "the server cancelled the download: {}", reason);
                *self.break_off.lock() = Some(reason.clone());
                self.fail(reason, None);
            }
            p @ (DownloadPacket::Request { .. } | DownloadPacket::Ready) => {
                warn!(download = self.id, "download client received {} packet", p.kind());
            }
        }
    }

    fn closed(&self) {
        if self.state().is_terminal() {
            return;
        }
        let reason = format!("channel {} closed", self.channel.id());
        warn!(download = self.id, "{} before the download finished", reason);
        *self.break_off.lock() = Some(reason.clone());
        self.fail(reason, None);
    }
}

impl fmt::Debug for ClientDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDownload")
            .field("id", &self.id)
            .field("channel", &self.channel.id())
            .field("state", &self.state())
            .field("received", &self.bytes_received())
            .field("written", &self.bytes_written())
            .finish()
    }
}
