//! Channel multiplexer over one physical connection
//!
//! Channel frames carry the channel id (u32 LE) first. The client opens
//! channels; the server accepts or declines them. Inbound packets are decoded
//! and dispatched on the connection's read thread.

use crate::channel::{Channel, ChannelListener, ListenerId, ListenerSet};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::protocol::frame;
use crate::protocol_core::{put_str, put_u32, PayloadReader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Outbound side of the physical connection.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame_type: u8, payload: &[u8]) -> Result<()>;
}

/// Type-erased inbound side of a channel.
trait ChannelSink: Send + Sync {
    fn deliver(&self, bytes: &[u8]);
    fn remote_closed(&self);
}

type OpenReply = std::result::Result<(), String>;

pub struct Multiplexer {
    sink: Weak<dyn FrameSink>,
    next_id: AtomicU32,
    channels: Mutex<HashMap<u32, Arc<dyn ChannelSink>>>,
    pending: Mutex<HashMap<u32, SyncSender<OpenReply>>>,
    lost: AtomicBool,
}

impl Multiplexer {
    pub fn new(sink: Weak<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            next_id: AtomicU32::new(1),
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            lost: AtomicBool::new(false),
        })
    }

    fn send(&self, frame_type: u8, payload: &[u8]) -> Result<()> {
        let sink = self.sink.upgrade().ok_or(Error::NotConnected)?;
        sink.send_frame(frame_type, payload)
    }

    fn unregister(&self, id: u32) {
        self.pending.lock().remove(&id);
        self.channels.lock().remove(&id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Open a channel for packet family `P` and wait for the server's answer.
    ///
    /// Fails with `ChannelDeclined`, `Timeout` (after telling the server the
    /// channel is closed) or `NotConnected`.
    pub fn establish_channel<P: Packet>(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Arc<MuxChannel<P>>> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(MuxChannel::<P> {
            id,
            mux: Arc::downgrade(self),
            listeners: ListenerSet::new(),
            closed: AtomicBool::new(false),
            _family: PhantomData,
        });

        let (tx, rx) = mpsc::sync_channel(1);
        self.pending.lock().insert(id, tx);
        // Registered up front: data may follow the accept immediately
        self.channels.lock().insert(id, channel.clone());

        let mut open = Vec::with_capacity(5);
        put_u32(&mut open, id);
        open.push(P::FAMILY);
        if let Err(e) = self.send(frame::CHANNEL_OPEN, &open) {
            self.unregister(id);
            return Err(e);
        }
        debug!(channel = id, family = P::FAMILY, "channel open sent");

        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => {
                debug!(channel = id, "channel accepted");
                Ok(channel)
            }
            Ok(Err(reason)) => {
                self.unregister(id);
                Err(Error::ChannelDeclined(reason))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.unregister(id);
                channel.closed.store(true, Ordering::SeqCst);
                if let Err(e) = self.send(frame::CHANNEL_CLOSE, &id.to_le_bytes()) {
                    debug!(channel = id, "close after timeout not sent: {}", e);
                }
                Err(Error::timeout(format!("establishing channel {}", id)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.unregister(id);
                Err(Error::NotConnected)
            }
        }
    }

    /// Route one channel frame read from the connection.
    pub fn handle_frame(&self, frame_type: u8, payload: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(payload);
        let id = r.u32()?;
        match frame_type {
            frame::CHANNEL_ACCEPT => match self.pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.try_send(Ok(()));
                }
                None => debug!(channel = id, "accept for unknown channel"),
            },
            frame::CHANNEL_DECLINE => {
                let reason = if r.is_empty() {
                    "declined by server".to_string()
                } else {
                    r.string()?
                };
                match self.pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.try_send(Err(reason));
                    }
                    None => debug!(channel = id, "decline for unknown channel"),
                }
            }
            frame::CHANNEL_DATA => {
                let target = self.channels.lock().get(&id).cloned();
                match target {
                    Some(channel) => channel.deliver(r.rest()),
                    None => debug!(channel = id, "data for unknown channel dropped"),
                }
            }
            frame::CHANNEL_CLOSE => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.try_send(Err("closed by server".to_string()));
                }
                let target = self.channels.lock().remove(&id);
                if let Some(channel) = target {
                    debug!(channel = id, "channel closed by server");
                    channel.remote_closed();
                }
            }
            frame::CHANNEL_OPEN => {
                // Server-initiated channels are not part of the client role
                let mut decline = Vec::new();
                put_u32(&mut decline, id);
                put_str(&mut decline, "client does not accept channels");
                self.send(frame::CHANNEL_DECLINE, &decline)?;
            }
            other => {
                return Err(Error::protocol(format!(
                    "frame type {} is not a channel frame",
                    other
                )))
            }
        }
        Ok(())
    }

    /// The physical connection is gone: every channel is closed and every
    /// pending establishment fails.
    pub fn connection_lost(&self) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending.lock().clear();
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        debug!(count = channels.len(), "closing channels after connection loss");
        for channel in channels {
            channel.remote_closed();
        }
    }
}

/// Typed channel handed out by [`Multiplexer::establish_channel`].
pub struct MuxChannel<P: Packet> {
    id: u32,
    mux: Weak<Multiplexer>,
    listeners: ListenerSet<P>,
    closed: AtomicBool,
    _family: PhantomData<fn() -> P>,
}

impl<P: Packet> Channel<P> for MuxChannel<P> {
    fn id(&self) -> u32 {
        self.id
    }

    fn send(&self, packet: P) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed(self.id));
        }
        let encoded = packet.encode();
        let mut payload = Vec::with_capacity(4 + encoded.len());
        put_u32(&mut payload, self.id);
        payload.extend_from_slice(&encoded);
        let mux = self.mux.upgrade().ok_or(Error::NotConnected)?;
        mux.send(frame::CHANNEL_DATA, &payload)
    }

    fn add_listener(&self, listener: Arc<dyn ChannelListener<P>>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(channel = self.id, "closing channel");
        let sent = match self.mux.upgrade() {
            Some(mux) => {
                mux.unregister(self.id);
                mux.send(frame::CHANNEL_CLOSE, &self.id.to_le_bytes())
            }
            None => Err(Error::NotConnected),
        };
        self.listeners.closed();
        sent
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<P: Packet> ChannelSink for MuxChannel<P> {
    fn deliver(&self, bytes: &[u8]) {
        match P::decode(bytes) {
            Ok(packet) => self.listeners.dispatch(packet),
            Err(e) => warn!(channel = self.id, "discarding undecodable packet: {}", e),
        }
    }

    fn remote_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.listeners.closed();
        }
    }
}
