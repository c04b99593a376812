//! Handoff between the connection read thread and a download's writer thread
//!
//! Payloads leave in the order they were put (FIFO). Both blocking
//! operations observe a [`CancelToken`] and [`HandoffQueue::wake`], so a
//! cancelled download never leaves a thread parked here.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared by a download and its writer.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capacity policy of the handoff queue.
///
/// `Bounded` applies backpressure: a full queue blocks the producer, which is
/// the connection read loop, so every channel on that connection stalls
/// until the slow writer catches up. `Unbounded` never blocks the read loop
/// but lets a slow disk grow memory without limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    Bounded(usize),
    Unbounded,
}

impl QueuePolicy {
    /// 0 selects the unbounded policy
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            QueuePolicy::Unbounded
        } else {
            QueuePolicy::Bounded(capacity)
        }
    }
}

struct State {
    items: VecDeque<Vec<u8>>,
    woken: bool,
}

pub struct HandoffQueue {
    policy: QueuePolicy,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl HandoffQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        let initial = match policy {
            QueuePolicy::Bounded(n) => n.min(64),
            QueuePolicy::Unbounded => 16,
        };
        Self {
            policy,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(initial),
                woken: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue a payload. Returns false when `cancel` fired while waiting for
    /// room; the payload is dropped in that case.
    pub fn put(&self, bytes: Vec<u8>, cancel: &CancelToken) -> bool {
        let mut st = self.state.lock();
        if let QueuePolicy::Bounded(cap) = self.policy {
            while st.items.len() >= cap {
                if cancel.is_cancelled() {
                    return false;
                }
                self.not_full.wait(&mut st);
            }
        }
        if cancel.is_cancelled() {
            return false;
        }
        st.items.push_back(bytes);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue the next payload, blocking while the queue is empty.
    ///
    /// Returns `None` when cancelled or after a [`wake`](Self::wake); the
    /// caller is expected to re-check its own state and call again.
    pub fn take(&self, cancel: &CancelToken) -> Option<Vec<u8>> {
        let mut st = self.state.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(bytes) = st.items.pop_front() {
                self.not_full.notify_one();
                return Some(bytes);
            }
            if st.woken {
                st.woken = false;
                return None;
            }
            self.not_empty.wait(&mut st);
        }
    }

    /// Release every blocked `take` and `put` once so they re-check state.
    pub fn wake(&self) {
        let mut st = self.state.lock();
        st.woken = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything still queued; returns the number of bytes discarded.
    pub fn clear(&self) -> u64 {
        let mut st = self.state.lock();
        let dropped = st.items.iter().map(|b| b.len() as u64).sum();
        st.items.clear();
        self.not_full.notify_all();
        dropped
    }
}
