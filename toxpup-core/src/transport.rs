//! Contracts of the external collaborators: the peer transport and the HTTP fetcher.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::{PeerIdentity, SessionHandle, ToxAddress, TransferId};
use crate::protocol::{FileKind, TransportEvent};

/// Sending half of a session's event channel, handed to the transport on start.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Well-known rendezvous node used to join the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub address: String,
    pub port: u16,
    /// Node public key, hex.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
}

/// Errors surfaced by transport calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer is not currently connected. Send paths recover by queuing.
    #[error("friend not connected")]
    FriendNotConnected,
    /// The transfer already finished or was cancelled by the peer.
    #[error("transfer no longer in progress")]
    NotTransferring,
    #[error("unknown friend {0}")]
    UnknownFriend(SessionHandle),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("operation not supported by transport")]
    Unsupported,
    #[error("{0}")]
    Other(String),
}

/// Opaque peer transport: one instance per account. Implementations own the
/// crypto, routing and wire format; the session only sees these primitives and
/// the [`TransportEvent`]s pushed into the sender given to [`Transport::start`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn bootstrap(&self, node: &BootstrapNode) -> Result<(), TransportError>;

    /// Start the transport loop. Events flow into `events` until [`Transport::stop`].
    async fn start(&self, events: EventSender) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    async fn send_message(
        &self,
        handle: SessionHandle,
        text: &str,
        is_action: bool,
    ) -> Result<(), TransportError>;

    async fn request_file_send(
        &self,
        handle: SessionHandle,
        kind: FileKind,
        filename: &str,
        size: u64,
    ) -> Result<TransferId, TransportError>;

    async fn send_file_chunk(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        position: u64,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn accept_incoming_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
    ) -> Result<(), TransportError>;

    /// Refuse or abort a transfer. The peer sees it cancelled.
    async fn cancel_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
    ) -> Result<(), TransportError>;

    /// Add a friend without sending a request (accepting an incoming one).
    async fn add_friend_no_request(
        &self,
        public_key: &PeerIdentity,
    ) -> Result<SessionHandle, TransportError>;

    /// Send a friend request to a full address.
    async fn add_friend(
        &self,
        address: &ToxAddress,
        message: &str,
    ) -> Result<SessionHandle, TransportError>;

    async fn delete_friend(&self, handle: SessionHandle) -> Result<(), TransportError>;

    /// All peers known in the current run.
    async fn list_peers(&self) -> Result<Vec<SessionHandle>, TransportError>;

    async fn resolve_identity(&self, handle: SessionHandle)
        -> Result<PeerIdentity, TransportError>;

    async fn friend_name(&self, handle: SessionHandle) -> Result<String, TransportError>;

    async fn own_public_key(&self) -> Result<PeerIdentity, TransportError>;

    async fn own_nospam(&self) -> Result<u32, TransportError>;

    async fn own_name(&self) -> Result<String, TransportError>;

    async fn set_own_name(&self, name: &str) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
#[error("fetching {url} failed: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

/// Downloads remote resources (avatars).
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording transport for session tests.

    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Bootstrap(String),
        Start,
        Stop,
        SendMessage(SessionHandle, String, bool),
        RequestFileSend(SessionHandle, FileKind, String, u64),
        SendChunk(SessionHandle, TransferId, u64, Vec<u8>),
        AcceptFile(SessionHandle, TransferId),
        CancelFile(SessionHandle, TransferId),
        AddFriendNoRequest(PeerIdentity),
        AddFriend(ToxAddress, String),
        DeleteFriend(SessionHandle),
        ListPeers,
        ResolveIdentity(SessionHandle),
        SetName(String),
    }

    #[derive(Default)]
    pub(crate) struct MockState {
        pub(crate) peers: BTreeMap<SessionHandle, PeerIdentity>,
        /// Peers for which sends succeed.
        pub(crate) connected: HashSet<SessionHandle>,
        pub(crate) fail_start: bool,
        pub(crate) failing_nodes: HashSet<String>,
        /// Forced result of every `send_message` call.
        pub(crate) send_error: Option<TransportError>,
        /// Message texts that fail with `FriendNotConnected`.
        pub(crate) unreachable_texts: HashSet<String>,
        pub(crate) chunk_error: Option<TransportError>,
        /// Ask for the first chunk before `request_file_send` returns.
        pub(crate) eager_chunk_request: bool,
        pub(crate) calls: Vec<Call>,
        pub(crate) events: Option<EventSender>,
        pub(crate) next_transfer: u32,
        pub(crate) name: String,
    }

    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub(crate) state: Mutex<MockState>,
        pub(crate) list_calls: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn with_peers(peers: &[(u32, PeerIdentity)]) -> Self {
            let mock = MockTransport::default();
            {
                let mut s = mock.state.lock();
                for (h, id) in peers {
                    s.peers.insert(SessionHandle(*h), *id);
                }
            }
            mock
        }

        pub(crate) fn set_connected(&self, handle: u32, connected: bool) {
            let mut s = self.state.lock();
            if connected {
                s.connected.insert(SessionHandle(handle));
            } else {
                s.connected.remove(&SessionHandle(handle));
            }
        }

        pub(crate) fn emit(&self, event: TransportEvent) {
            if let Some(tx) = &self.state.lock().events {
                let _ = tx.send(event);
            }
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.state.lock().calls.clone()
        }

        pub(crate) fn sent_messages(&self) -> Vec<(SessionHandle, String, bool)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::SendMessage(h, t, a) => Some((h, t, a)),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.state.lock().calls.push(call);
        }

        fn check_connected(&self, handle: SessionHandle) -> Result<(), TransportError> {
            let s = self.state.lock();
            if !s.peers.contains_key(&handle) {
                return Err(TransportError::UnknownFriend(handle));
            }
            if !s.connected.contains(&handle) {
                return Err(TransportError::FriendNotConnected);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn bootstrap(&self, node: &BootstrapNode) -> Result<(), TransportError> {
            self.record(Call::Bootstrap(node.address.clone()));
            if self.state.lock().failing_nodes.contains(&node.address) {
                return Err(TransportError::Other("unreachable".into()));
            }
            Ok(())
        }

        async fn start(&self, events: EventSender) -> Result<(), TransportError> {
            self.record(Call::Start);
            let mut s = self.state.lock();
            if s.fail_start {
                return Err(TransportError::Other("start failed".into()));
            }
            s.events = Some(events);
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.record(Call::Stop);
            Ok(())
        }

        async fn send_message(
            &self,
            handle: SessionHandle,
            text: &str,
            is_action: bool,
        ) -> Result<(), TransportError> {
            let forced = self.state.lock().send_error.clone();
            if let Some(err) = forced {
                return Err(err);
            }
            if self.state.lock().unreachable_texts.contains(text) {
                return Err(TransportError::FriendNotConnected);
            }
            self.check_connected(handle)?;
            self.record(Call::SendMessage(handle, text.to_string(), is_action));
            Ok(())
        }

        async fn request_file_send(
            &self,
            handle: SessionHandle,
            kind: FileKind,
            filename: &str,
            size: u64,
        ) -> Result<TransferId, TransportError> {
            self.check_connected(handle)?;
            self.record(Call::RequestFileSend(handle, kind, filename.to_string(), size));
            let (transfer, eager) = {
                let mut s = self.state.lock();
                s.next_transfer += 1;
                (TransferId(s.next_transfer), s.eager_chunk_request)
            };
            if eager {
                self.emit(TransportEvent::FileChunkRequested {
                    handle,
                    transfer,
                    position: 0,
                    length: size as usize,
                });
                // Give the dispatcher a chance to see the request first.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Ok(transfer)
        }

        async fn send_file_chunk(
            &self,
            handle: SessionHandle,
            transfer: TransferId,
            position: u64,
            data: &[u8],
        ) -> Result<(), TransportError> {
            let forced = self.state.lock().chunk_error.clone();
            if let Some(err) = forced {
                return Err(err);
            }
            self.record(Call::SendChunk(handle, transfer, position, data.to_vec()));
            Ok(())
        }

        async fn accept_incoming_file(
            &self,
            handle: SessionHandle,
            transfer: TransferId,
        ) -> Result<(), TransportError> {
            self.record(Call::AcceptFile(handle, transfer));
            Ok(())
        }

        async fn cancel_file(
            &self,
            handle: SessionHandle,
            transfer: TransferId,
        ) -> Result<(), TransportError> {
            self.record(Call::CancelFile(handle, transfer));
            Ok(())
        }

        async fn add_friend_no_request(
            &self,
            public_key: &PeerIdentity,
        ) -> Result<SessionHandle, TransportError> {
            self.record(Call::AddFriendNoRequest(*public_key));
            let mut s = self.state.lock();
            let handle = SessionHandle(s.peers.keys().map(|h| h.0 + 1).max().unwrap_or(0));
            s.peers.insert(handle, *public_key);
            Ok(handle)
        }

        async fn add_friend(
            &self,
            address: &ToxAddress,
            message: &str,
        ) -> Result<SessionHandle, TransportError> {
            self.record(Call::AddFriend(*address, message.to_string()));
            let mut s = self.state.lock();
            let handle = SessionHandle(s.peers.keys().map(|h| h.0 + 1).max().unwrap_or(0));
            s.peers.insert(handle, *address.public_key());
            Ok(handle)
        }

        async fn delete_friend(&self, handle: SessionHandle) -> Result<(), TransportError> {
            self.record(Call::DeleteFriend(handle));
            self.state
                .lock()
                .peers
                .remove(&handle)
                .map(|_| ())
                .ok_or(TransportError::UnknownFriend(handle))
        }

        async fn list_peers(&self) -> Result<Vec<SessionHandle>, TransportError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.record(Call::ListPeers);
            // Yield so overlapping refreshes actually overlap.
            tokio::task::yield_now().await;
            Ok(self.state.lock().peers.keys().copied().collect())
        }

        async fn resolve_identity(
            &self,
            handle: SessionHandle,
        ) -> Result<PeerIdentity, TransportError> {
            self.record(Call::ResolveIdentity(handle));
            self.state
                .lock()
                .peers
                .get(&handle)
                .copied()
                .ok_or(TransportError::UnknownFriend(handle))
        }

        async fn friend_name(&self, handle: SessionHandle) -> Result<String, TransportError> {
            if self.state.lock().peers.contains_key(&handle) {
                Ok(format!("friend{}\0\0", handle.0))
            } else {
                Err(TransportError::UnknownFriend(handle))
            }
        }

        async fn own_public_key(&self) -> Result<PeerIdentity, TransportError> {
            Ok(PeerIdentity::from_bytes([0; 32]))
        }

        async fn own_nospam(&self) -> Result<u32, TransportError> {
            Ok(0)
        }

        async fn own_name(&self) -> Result<String, TransportError> {
            Ok(self.state.lock().name.clone())
        }

        async fn set_own_name(&self, name: &str) -> Result<(), TransportError> {
            self.record(Call::SetName(name.to_string()));
            self.state.lock().name = name.to_string();
            Ok(())
        }
    }
}
