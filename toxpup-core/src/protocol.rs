//! Event types crossing the session boundary: transport → core and core → bridge.

use bytes::Bytes;

use crate::identity::{PeerIdentity, SessionHandle, ToxAddress, TransferId};
use crate::transfer::FileTransfer;

/// Declared purpose of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Ordinary file contents.
    Data,
    /// Profile picture of the sending account.
    Avatar,
}

/// Presence of a peer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// Discrete events emitted by the transport. Delivered through a single
/// channel per session and handled one at a time by the dispatch loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    SelfConnection {
        connected: bool,
    },
    FriendConnection {
        handle: SessionHandle,
        connected: bool,
    },
    FriendMessage {
        handle: SessionHandle,
        text: String,
        is_action: bool,
    },
    FriendStatus {
        handle: SessionHandle,
        status: UserStatus,
    },
    FriendStatusMessage {
        handle: SessionHandle,
        text: String,
    },
    FriendTyping {
        handle: SessionHandle,
        typing: bool,
    },
    FriendName {
        handle: SessionHandle,
    },
    FriendRequest {
        public_key: PeerIdentity,
        message: String,
    },
    FileOffer {
        handle: SessionHandle,
        transfer: TransferId,
        size: u64,
        kind: FileKind,
        filename: String,
    },
    FileChunkReceived {
        handle: SessionHandle,
        transfer: TransferId,
        position: u64,
        data: Bytes,
        is_final: bool,
    },
    FileChunkRequested {
        handle: SessionHandle,
        transfer: TransferId,
        position: u64,
        length: usize,
    },
    FileControl {
        handle: SessionHandle,
        transfer: TransferId,
        is_cancel: bool,
    },
}

/// Notifications emitted to the bridge collaborator.
#[derive(Debug, Clone)]
pub enum Notification {
    Connected {
        address: ToxAddress,
    },
    Disconnected,
    Message {
        peer: PeerIdentity,
        text: String,
        is_action: bool,
    },
    FileReceived {
        peer: PeerIdentity,
        file: FileTransfer,
    },
    AvatarReceived {
        peer: PeerIdentity,
        file: FileTransfer,
    },
    PresenceChanged {
        peer: PeerIdentity,
        status: UserStatus,
    },
    StatusMessageChanged {
        peer: PeerIdentity,
        text: String,
    },
    TypingChanged {
        peer: PeerIdentity,
        typing: bool,
    },
    NameChanged {
        peer: PeerIdentity,
    },
    FriendRequestReceived {
        public_key: PeerIdentity,
        message: String,
    },
}
