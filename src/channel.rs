//! Virtual channel contract consumed by the download core
//!
//! A channel is a typed, bidirectional packet pipe multiplexed over one
//! physical connection. Inbound packets are pushed to the registered
//! listeners in arrival order, on the connection's read thread.

use crate::error::Result;
use crate::packet::{DownloadPacket, Packet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Receives the packets of one channel.
pub trait ChannelListener<P: Packet>: Send + Sync {
    fn received(&self, packet: P);

    /// The channel went away (closed by either side or the connection broke).
    fn closed(&self) {}
}

/// Handle returned by [`Channel::add_listener`], used to deregister.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub trait Channel<P: Packet>: Send + Sync {
    fn id(&self) -> u32;
    fn send(&self, packet: P) -> Result<()>;
    fn add_listener(&self, listener: Arc<dyn ChannelListener<P>>) -> ListenerId;
    /// Returns false when `id` was not registered (already removed).
    fn remove_listener(&self, id: ListenerId) -> bool;
    fn listener_count(&self) -> usize;
    fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

pub type DownloadChannel = Arc<dyn Channel<DownloadPacket>>;

/// Listener bookkeeping shared by channel implementations.
///
/// Callbacks run on a snapshot taken outside the lock, so a listener may
/// deregister itself (or others) from inside `received`.
pub struct ListenerSet<P: Packet> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ChannelListener<P>>)>>,
}

impl<P: Packet> ListenerSet<P> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn ChannelListener<P>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChannelListener<P>>> {
        self.listeners.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn dispatch(&self, packet: P) {
        let targets = self.snapshot();
        let Some((last, rest)) = targets.split_last() else {
            trace!(?packet, "no listener registered, packet dropped");
            return;
        };
        for listener in rest {
            listener.received(packet.clone());
        }
        last.received(packet);
    }

    pub fn closed(&self) {
        for listener in self.snapshot() {
            listener.closed();
        }
    }
}

impl<P: Packet> Default for ListenerSet<P> {
    fn default() -> Self {
        Self::new()
    }
}
