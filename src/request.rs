//! Blocking request/response over an asynchronous channel
//!
//! Sends `Request{url}` and parks the caller until the matching `Header`
//! arrives, the timeout fires, the wait is interrupted or the channel goes
//! away. Whatever happens, the temporary channel listener is removed before
//! `request` returns.

use crate::channel::{ChannelListener, DownloadChannel, ListenerId};
use crate::error::{Error, Result};
use crate::packet::{DownloadPacket, Header};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Default)]
struct SlotState {
    header: Option<Header>,
    interrupted: bool,
    closed: bool,
}

#[derive(Default)]
struct ResponseSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ResponseSlot {
    fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.ready.notify_all();
    }
}

impl ChannelListener<DownloadPacket> for ResponseSlot {
    fn received(&self, packet: DownloadPacket) {
        match packet {
            DownloadPacket::Header(header) => {
                let mut st = self.state.lock();
                if st.header.is_none() {
                    st.header = Some(header);
                    self.ready.notify_all();
                }
            }
            other => warn!("unexpected {} packet while waiting for header", other.kind()),
        }
    }

    fn closed(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

/// Removes the slot from the channel on every exit path.
struct Registration<'a> {
    channel: &'a DownloadChannel,
    id: ListenerId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.channel.remove_listener(self.id);
    }
}

/// One header request. A request object serves at most one caller at a time.
pub struct HeaderRequest {
    channel: DownloadChannel,
    url: String,
    gate: Mutex<()>,
    slot: Arc<ResponseSlot>,
}

impl HeaderRequest {
    pub fn new(channel: DownloadChannel, url: impl Into<String>) -> Self {
        Self {
            channel,
            url: url.into(),
            gate: Mutex::new(()),
            slot: Arc::new(ResponseSlot::default()),
        }
    }

    /// Send the request and wait up to `timeout` for the header.
    pub fn request(&self, timeout: Duration) -> Result<Header> {
        let _serial = self.gate.lock();
        {
            let mut st = self.slot.state.lock();
            st.header = None;
            st.closed = false;
        }

        let _registration = Registration {
            channel: &self.channel,
            id: self.channel.add_listener(self.slot.clone()),
        };

        debug!(channel = self.channel.id(), url = %self.url, "requesting header");
        self.channel.send(DownloadPacket::Request {
            url: self.url.clone(),
        })?;

        let deadline = Instant::now() + timeout;
        let mut st = self.slot.state.lock();
        loop {
            if let Some(header) = st.header.take() {
                return Ok(header);
            }
            if st.interrupted {
                return Err(Error::interrupted("waiting for download header"));
            }
            if st.closed {
                return Err(Error::ChannelClosed(self.channel.id()));
            }
            if self.slot.ready.wait_until(&mut st, deadline).timed_out() {
                // A header may have raced the deadline
                return st
                    .header
                    .take()
                    .ok_or_else(|| Error::timeout("waiting for download header"));
            }
        }
    }

    /// Wake a caller blocked in [`request`](Self::request); it fails with
    /// `Interrupted`. Sticky: later requests fail the same way.
    pub fn interrupt(&self) {
        self.slot.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use crate::channel::Channel;
    use std::thread;

    fn header(name: &str) -> Header {
        Header {
            length: Some(42),
            file_name: name.to_string(),
        }
    }

    #[test]
    fn header_reply_is_returned_and_listener_removed() {
        let channel = MemoryChannel::<DownloadPacket>::new(1);
        channel.respond_with(|p| match p {
            DownloadPacket::Request { url } => {
                assert_eq!(url, "bnj://host/file.bin");
                Some(DownloadPacket::Header(header("file.bin")))
            }
            _ => None,
        });
        let request = HeaderRequest::new(channel.clone(), "bnj://host/file.bin");

        let h = request.request(Duration::from_secs(1)).unwrap();
        assert_eq!(h, header("file.bin"));
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn missing_reply_times_out_and_leaves_no_listener() {
        let channel = MemoryChannel::<DownloadPacket>::new(2);
        let request = HeaderRequest::new(channel.clone(), "bnj://host/x");

        let started = Instant::now();
        let err = request.request(Duration::from_millis(100)).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn interrupt_wakes_the_waiting_caller() {
        let channel = MemoryChannel::<DownloadPacket>::new(3);
        let request = Arc::new(HeaderRequest::new(channel.clone(), "bnj://host/x"));

        let r = request.clone();
        let waiter = thread::spawn(move || r.request(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        request.interrupt();

        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn send_failure_propagates_and_leaves_no_listener() {
        let channel = MemoryChannel::<DownloadPacket>::new(4);
        channel.fail_sends(true);
        let request = HeaderRequest::new(channel.clone(), "bnj://host/x");

        assert!(matches!(
            request.request(Duration::from_secs(1)),
            Err(Error::Io(_))
        ));
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn non_header_packets_are_ignored_while_waiting() {
        let channel = MemoryChannel::<DownloadPacket>::new(5);
        channel.respond_with(|_| Some(DownloadPacket::Data(vec![1, 2, 3])));
        let request = Arc::new(HeaderRequest::new(channel.clone(), "bnj://host/x"));

        let r = request.clone();
        let waiter = thread::spawn(move || r.request(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        channel.inject(DownloadPacket::Finish);
        channel.inject(DownloadPacket::Header(header("late.bin")));

        assert_eq!(waiter.join().unwrap().unwrap(), header("late.bin"));
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn channel_close_fails_the_wait() {
        let channel = MemoryChannel::<DownloadPacket>::new(6);
        let request = Arc::new(HeaderRequest::new(channel.clone(), "bnj://host/x"));

        let r = request.clone();
        let waiter = thread::spawn(move || r.request(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        channel.close_remote();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(Error::ChannelClosed(6))
        ));
    }
}
