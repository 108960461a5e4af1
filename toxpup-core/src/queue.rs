//! Outbound queue: per-peer FIFO of sends waiting for the peer to come online.
//! In memory only; queues are created on first push and dropped once empty.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::identity::SessionHandle;

/// A send that could not be delivered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    Message { text: String, is_action: bool },
    File { data: Bytes, filename: String },
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    queues: HashMap<SessionHandle, VecDeque<QueueEntry>>,
    /// Peers with a drain worker running.
    draining: HashSet<SessionHandle>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the back of the peer's queue.
    pub fn push(&mut self, handle: SessionHandle, entry: QueueEntry) {
        self.queues.entry(handle).or_default().push_back(entry);
    }

    /// Pop the oldest entry; the queue is removed when it empties.
    pub fn pop(&mut self, handle: SessionHandle) -> Option<QueueEntry> {
        let queue = self.queues.get_mut(&handle)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&handle);
        }
        entry
    }

    pub fn len(&self, handle: SessionHandle) -> usize {
        self.queues.get(&handle).map_or(0, VecDeque::len)
    }

    pub fn has_queue(&self, handle: SessionHandle) -> bool {
        self.queues.contains_key(&handle)
    }

    /// Drop everything queued for a peer.
    pub fn clear(&mut self, handle: SessionHandle) -> usize {
        self.queues.remove(&handle).map_or(0, |q| q.len())
    }

    /// Claim the drain slot for a peer. Returns false if a drain is already running.
    pub fn begin_drain(&mut self, handle: SessionHandle) -> bool {
        self.draining.insert(handle)
    }

    pub fn end_drain(&mut self, handle: SessionHandle) {
        self.draining.remove(&handle);
    }

    pub fn is_draining(&self, handle: SessionHandle) -> bool {
        self.draining.contains(&handle)
    }
}
