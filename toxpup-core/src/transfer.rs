//! File transfer engine: registry of in-flight chunked transfers keyed by
//! (peer handle, transfer id).
//!
//! Inbound transfers assemble into a zero-filled buffer of the declared size;
//! completion is signalled only by the final-chunk flag, gaps are not checked.
//! Outbound transfers keep the whole source buffer so any byte range can be
//! served again, in any order.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::identity::{SessionHandle, TransferId};
use crate::protocol::FileKind;

/// Largest inbound transfer we allocate a buffer for.
pub const MAX_INBOUND_SIZE: u64 = 256 * 1024 * 1024; // 256 MiB

/// Filename used when pushing our avatar.
pub const AVATAR_FILENAME: &str = "avatar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
enum Buffer {
    /// Inbound, still receiving.
    Filling(Vec<u8>),
    /// Outbound source, or a completed inbound transfer.
    Frozen(Bytes),
}

/// One transfer and its bytes.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub direction: Direction,
    pub kind: FileKind,
    pub name: String,
    /// Declared total size.
    pub size: u64,
    buffer: Buffer,
}

impl FileTransfer {
    fn inbound(kind: FileKind, name: String, size: u64) -> Self {
        Self {
            direction: Direction::Inbound,
            kind,
            name,
            size,
            buffer: Buffer::Filling(vec![0u8; size as usize]),
        }
    }

    fn outbound(kind: FileKind, name: String, data: Bytes) -> Self {
        Self {
            direction: Direction::Outbound,
            kind,
            name,
            size: data.len() as u64,
            buffer: Buffer::Frozen(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.buffer {
            Buffer::Filling(v) => v,
            Buffer::Frozen(b) => b,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self.buffer {
            Buffer::Filling(v) => Bytes::from(v),
            Buffer::Frozen(b) => b,
        }
    }

    fn freeze(self) -> Self {
        let Self {
            direction,
            kind,
            name,
            size,
            buffer,
        } = self;
        let buffer = match buffer {
            Buffer::Filling(v) => Buffer::Frozen(Bytes::from(v)),
            frozen => frozen,
        };
        Self {
            direction,
            kind,
            name,
            size,
            buffer,
        }
    }
}

/// Result of applying a received chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// No such inbound transfer.
    Unknown,
    InProgress,
    /// Final chunk seen; the transfer has been deregistered.
    Complete(FileTransfer),
}

/// Answer to a peer's chunk request.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkRequestOutcome {
    /// No such outbound transfer.
    Unknown,
    /// Zero-length request: peer has everything, transfer deregistered.
    Finished,
    Data(Bytes),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OfferError {
    #[error("declared size {0} exceeds limit")]
    TooLarge(u64),
    #[error("transfer already registered")]
    Duplicate,
}

type TransferKey = (SessionHandle, TransferId);

#[derive(Debug, Default)]
pub struct TransferEngine {
    transfers: HashMap<TransferKey, FileTransfer>,
    /// Peers with an avatar push in flight.
    avatar_pushes: HashSet<SessionHandle>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_outbound(
        &mut self,
        handle: SessionHandle,
        id: TransferId,
        kind: FileKind,
        name: &str,
        data: Bytes,
    ) {
        self.transfers
            .insert((handle, id), FileTransfer::outbound(kind, name.to_string(), data));
    }

    /// Register an incoming offer with a zero-filled buffer of the declared size.
    pub fn register_inbound(
        &mut self,
        handle: SessionHandle,
        id: TransferId,
        kind: FileKind,
        name: &str,
        size: u64,
    ) -> Result<(), OfferError> {
        if size > MAX_INBOUND_SIZE {
            return Err(OfferError::TooLarge(size));
        }
        if self.transfers.contains_key(&(handle, id)) {
            return Err(OfferError::Duplicate);
        }
        self.transfers
            .insert((handle, id), FileTransfer::inbound(kind, name.to_string(), size));
        Ok(())
    }

    /// Copy `data` into the inbound buffer at `position`. Bytes past the declared
    /// size are dropped. A final chunk completes the transfer.
    pub fn write_chunk(
        &mut self,
        handle: SessionHandle,
        id: TransferId,
        position: u64,
        data: &[u8],
        is_final: bool,
    ) -> ChunkOutcome {
        let key = (handle, id);
        let Some(transfer) = self.transfers.get_mut(&key) else {
            return ChunkOutcome::Unknown;
        };
        let Buffer::Filling(buf) = &mut transfer.buffer else {
            return ChunkOutcome::Unknown;
        };
        let len = buf.len();
        let start = (position as usize).min(len);
        let end = start.saturating_add(data.len()).min(len);
        buf[start..end].copy_from_slice(&data[..end - start]);

        if !is_final {
            return ChunkOutcome::InProgress;
        }
        match self.transfers.remove(&key) {
            Some(done) => ChunkOutcome::Complete(done.freeze()),
            None => ChunkOutcome::Unknown,
        }
    }

    /// Serve `[position, position + length)` of an outbound transfer, clamped to
    /// its size. Zero length means the peer is done.
    pub fn read_chunk(
        &mut self,
        handle: SessionHandle,
        id: TransferId,
        position: u64,
        length: usize,
    ) -> ChunkRequestOutcome {
        let key = (handle, id);
        let Some(transfer) = self.transfers.get(&key) else {
            return ChunkRequestOutcome::Unknown;
        };
        let Buffer::Frozen(data) = &transfer.buffer else {
            return ChunkRequestOutcome::Unknown;
        };
        if transfer.direction != Direction::Outbound {
            return ChunkRequestOutcome::Unknown;
        }
        if length == 0 {
            self.transfers.remove(&key);
            return ChunkRequestOutcome::Finished;
        }
        let start = (position as usize).min(data.len());
        let end = start.saturating_add(length).min(data.len());
        ChunkRequestOutcome::Data(data.slice(start..end))
    }

    pub fn remove(&mut self, handle: SessionHandle, id: TransferId) -> Option<FileTransfer> {
        self.transfers.remove(&(handle, id))
    }

    /// Drop every transfer with a peer. Returns how many were dropped.
    pub fn drop_peer(&mut self, handle: SessionHandle) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|(h, _), _| *h != handle);
        before - self.transfers.len()
    }

    pub fn get(&self, handle: SessionHandle, id: TransferId) -> Option<&FileTransfer> {
        self.transfers.get(&(handle, id))
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Claim the avatar push slot for a peer. False if one is running.
    pub fn begin_avatar_push(&mut self, handle: SessionHandle) -> bool {
        self.avatar_pushes.insert(handle)
    }

    pub fn end_avatar_push(&mut self, handle: SessionHandle) {
        self.avatar_pushes.remove(&handle);
    }

    pub fn is_pushing_avatar(&self, handle: SessionHandle) -> bool {
        self.avatar_pushes.contains(&handle)
    }
}

/// Last avatar applied to the local account.
#[derive(Debug, Default)]
pub struct AvatarCache {
    url: Option<String>,
    data: Option<Bytes>,
    /// Bumped on every `set`.
    generation: u64,
}

impl AvatarCache {
    pub fn is_current(&self, url: &str) -> bool {
        self.url.as_deref() == Some(url)
    }

    pub fn set(&mut self, url: &str, data: Bytes) {
        self.url = Some(url.to_string());
        self.data = Some(data);
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn data(&self) -> Option<Bytes> {
        self.data.clone()
    }
}
