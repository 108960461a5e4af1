//! Session controller: one account's transport plus the per-peer state around it.
//!
//! Transport events arrive on a single channel and are handled one at a time by
//! a dispatch task. Queue drains, avatar pushes and automatic reconnects are
//! spawned off that task and only log their failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::directory::PeerDirectory;
use crate::error::SessionError;
use crate::identity::{PeerIdentity, SessionHandle, ToxAddress, TransferId};
use crate::protocol::{FileKind, Notification, TransportEvent, UserStatus};
use crate::queue::{OutboundQueue, QueueEntry};
use crate::reachability::{ReachabilityTracker, Transition};
use crate::transfer::{
    AvatarCache, ChunkOutcome, ChunkRequestOutcome, OfferError, TransferEngine,
    AVATAR_FILENAME,
};
use crate::transport::{BootstrapNode, EventSender, Fetcher, Transport, TransportError};

/// Static settings of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Seeds tried on every (re)connect, all of them, in order.
    pub bootstrap_nodes: Vec<BootstrapNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Handle to one account's session. Cheap to clone; all clones share state.
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T: Transport> {
    transport: T,
    fetcher: Arc<dyn Fetcher>,
    config: SessionConfig,
    directory: PeerDirectory,
    reachability: Mutex<ReachabilityTracker>,
    queue: Mutex<OutboundQueue>,
    transfers: Mutex<TransferEngine>,
    /// Held from requesting an outbound transfer until it is registered; chunk
    /// requests wait on it so none arrive for an id we have not stored yet.
    offer_gate: tokio::sync::Mutex<()>,
    /// Async lock: held across the fetch so concurrent updates serialize.
    avatar: tokio::sync::Mutex<AvatarCache>,
    state: Mutex<ConnectionState>,
    own_address: Mutex<Option<ToxAddress>>,
    /// Set by an explicit disconnect; suppresses automatic reconnect.
    stopping: AtomicBool,
    reconnecting: AtomicBool,
    events: Mutex<Option<EventSender>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}

impl<T: Transport> Session<T> {
    /// Create a disconnected session. Notifications for the bridge arrive on the
    /// returned receiver.
    pub fn new(
        transport: T,
        fetcher: Arc<dyn Fetcher>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notifications, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            transport,
            fetcher,
            config,
            directory: PeerDirectory::new(),
            reachability: Mutex::new(ReachabilityTracker::new()),
            queue: Mutex::new(OutboundQueue::new()),
            transfers: Mutex::new(TransferEngine::new()),
            offer_gate: tokio::sync::Mutex::new(()),
            avatar: tokio::sync::Mutex::new(AvatarCache::default()),
            state: Mutex::new(ConnectionState::Disconnected),
            own_address: Mutex::new(None),
            stopping: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            events: Mutex::new(None),
            dispatcher: Mutex::new(None),
            notifications,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Bootstrap against every configured seed, wire the event channel and
    /// start the transport. A transport that fails to start fails the call.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Disconnected {
                debug!(state = ?*state, "connect ignored");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.bootstrap().await;

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.spawn_dispatcher(rx);
        *self.shared.events.lock() = Some(tx.clone());

        if let Err(err) = self.shared.transport.start(tx).await {
            error!(%err, "transport failed to start");
            self.shared.stop_dispatcher();
            *self.shared.state.lock() = ConnectionState::Disconnected;
            return Err(err.into());
        }
        info!("transport started");
        Ok(())
    }

    /// Stop the transport. Unlike a connection loss this never reconnects.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let result = self.shared.transport.stop().await;
        let was = std::mem::replace(
            &mut *self.shared.state.lock(),
            ConnectionState::Disconnected,
        );
        *self.shared.own_address.lock() = None;
        self.shared.reachability.lock().clear();
        self.shared.stop_dispatcher();
        if was == ConnectionState::Connected {
            self.shared.notify(Notification::Disconnected);
        }
        info!("transport stopped");
        result.map_err(Into::into)
    }

    /// Send a text message, queuing it if the peer is offline.
    pub async fn send_message(
        &self,
        peer: &PeerIdentity,
        text: &str,
        is_action: bool,
    ) -> Result<(), SessionError> {
        let handle = self.resolve(peer).await?;
        let entry = QueueEntry::Message {
            text: text.to_string(),
            is_action,
        };
        self.shared.deliver(handle, entry).await
    }

    /// Offer a file to a peer, queuing the offer if the peer is offline.
    pub async fn send_file(
        &self,
        peer: &PeerIdentity,
        data: Bytes,
        filename: &str,
    ) -> Result<(), SessionError> {
        let handle = self.resolve(peer).await?;
        let entry = QueueEntry::File {
            data,
            filename: filename.to_string(),
        };
        self.shared.deliver(handle, entry).await
    }

    /// Replay a peer's queue now. Returns false if a drain for that peer is
    /// already running.
    pub async fn pop_queue(&self, handle: SessionHandle) -> bool {
        self.shared.pop_queue(handle).await
    }

    /// Entries waiting for a peer.
    pub fn queued(&self, handle: SessionHandle) -> usize {
        self.shared.queue.lock().len(handle)
    }

    pub async fn set_name(&self, name: &str) -> Result<(), SessionError> {
        self.shared.transport.set_own_name(name).await?;
        Ok(())
    }

    pub async fn own_name(&self) -> Result<String, SessionError> {
        Ok(self.shared.transport.own_name().await?)
    }

    /// Apply a new avatar. An unchanged URL is a no-op; otherwise the image is
    /// fetched once and offered to every reachable peer. Offline peers get it
    /// when they next come online.
    pub async fn set_avatar(&self, url: &str) -> Result<(), SessionError> {
        let claimed = {
            let mut avatar = self.shared.avatar.lock().await;
            if avatar.is_current(url) {
                debug!(url, "avatar unchanged");
                return Ok(());
            }
            let data = self.shared.fetcher.fetch(url).await?;
            avatar.set(url, data);
            // Peers with a push already running pick up the new buffer there.
            let mut peers = self.shared.reachability.lock().reachable();
            let mut transfers = self.shared.transfers.lock();
            peers.retain(|handle| transfers.begin_avatar_push(*handle));
            peers
        };
        info!(url, peers = claimed.len(), "pushing new avatar");
        for handle in claimed {
            self.shared.push_avatar(handle).await;
        }
        Ok(())
    }

    /// Accept an incoming friend request.
    pub async fn accept_friend_request(&self, public_key: &PeerIdentity) -> Result<(), SessionError> {
        let handle = self.shared.transport.add_friend_no_request(public_key).await?;
        self.shared.directory.register(*public_key, handle);
        info!(peer = %public_key, %handle, "accepted friend request");
        Ok(())
    }

    /// Send a friend request to a full address.
    pub async fn add_friend(&self, address: &ToxAddress, message: &str) -> Result<(), SessionError> {
        let handle = self.shared.transport.add_friend(address, message).await?;
        self.shared.directory.register(*address.public_key(), handle);
        info!(peer = %address.public_key(), %handle, "sent friend request");
        Ok(())
    }

    /// Remove a friend and everything pending with it.
    pub async fn remove_friend(&self, public_key: &PeerIdentity) -> Result<(), SessionError> {
        let handle = self.resolve(public_key).await?;
        self.shared.transport.delete_friend(handle).await?;
        self.shared.directory.remove(public_key);
        self.shared.reachability.lock().forget(handle);
        let dropped = self.shared.queue.lock().clear(handle);
        let transfers = self.shared.transfers.lock().drop_peer(handle);
        info!(peer = %public_key, dropped, transfers, "removed friend");
        Ok(())
    }

    /// Our reachable address, cached for the current connection.
    pub async fn own_address(&self) -> Result<ToxAddress, SessionError> {
        if let Some(address) = *self.shared.own_address.lock() {
            return Ok(address);
        }
        Ok(self.shared.compute_address().await?)
    }

    /// Display name of a friend, NUL padding stripped.
    pub async fn friend_name(&self, peer: &PeerIdentity) -> Result<String, SessionError> {
        let handle = self.resolve(peer).await?;
        let name = self.shared.transport.friend_name(handle).await?;
        Ok(name.replace('\0', ""))
    }

    pub async fn list_friends(&self) -> Result<Vec<PeerIdentity>, SessionError> {
        self.shared
            .directory
            .refresh_all(&self.shared.transport)
            .await?;
        Ok(self.shared.directory.identities())
    }

    pub async fn is_friend(&self, peer: &PeerIdentity) -> Result<bool, SessionError> {
        match self.resolve(peer).await {
            Ok(_) => Ok(true),
            Err(SessionError::UnknownPeer(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn resolve(&self, peer: &PeerIdentity) -> Result<SessionHandle, SessionError> {
        self.shared
            .directory
            .resolve_handle(&self.shared.transport, peer)
            .await
    }
}

impl<T: Transport> Shared<T> {
    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            trace!("notification receiver dropped");
        }
    }

    async fn bootstrap(&self) {
        for node in &self.config.bootstrap_nodes {
            match self.transport.bootstrap(node).await {
                Ok(()) => trace!(address = %node.address, port = node.port, "bootstrapped"),
                Err(err) => warn!(address = %node.address, port = node.port, %err, "bootstrap failed"),
            }
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.handle_event(event).await;
            }
            trace!("event dispatcher finished");
        });
        if let Some(old) = self.dispatcher.lock().replace(task) {
            old.abort();
        }
    }

    fn stop_dispatcher(&self) {
        *self.events.lock() = None;
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }

    async fn compute_address(&self) -> Result<ToxAddress, TransportError> {
        let public_key = self.transport.own_public_key().await?;
        let nospam = self.transport.own_nospam().await?;
        Ok(ToxAddress::new(public_key, nospam))
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::SelfConnection { connected: true } => self.on_self_connected().await,
            TransportEvent::SelfConnection { connected: false } => self.on_self_disconnected(),
            TransportEvent::FriendConnection { handle, connected } => {
                self.on_friend_connection(handle, connected).await
            }
            TransportEvent::FriendMessage {
                handle,
                text,
                is_action,
            } => {
                if let Some(peer) = self.peer(handle).await {
                    self.notify(Notification::Message {
                        peer,
                        text,
                        is_action,
                    });
                }
            }
            TransportEvent::FriendStatus { handle, status } => {
                if let Some(peer) = self.peer(handle).await {
                    self.notify(Notification::PresenceChanged { peer, status });
                }
            }
            TransportEvent::FriendStatusMessage { handle, text } => {
                if let Some(peer) = self.peer(handle).await {
                    self.notify(Notification::StatusMessageChanged { peer, text });
                }
            }
            TransportEvent::FriendTyping { handle, typing } => {
                if let Some(peer) = self.peer(handle).await {
                    self.notify(Notification::TypingChanged { peer, typing });
                }
            }
            TransportEvent::FriendName { handle } => {
                if let Some(peer) = self.peer(handle).await {
                    self.notify(Notification::NameChanged { peer });
                }
            }
            TransportEvent::FriendRequest {
                public_key,
                message,
            } => {
                info!(peer = %public_key, "friend request received");
                self.notify(Notification::FriendRequestReceived {
                    public_key,
                    message,
                });
            }
            TransportEvent::FileOffer {
                handle,
                transfer,
                size,
                kind,
                filename,
            } => self.on_file_offer(handle, transfer, size, kind, &filename).await,
            TransportEvent::FileChunkReceived {
                handle,
                transfer,
                position,
                data,
                is_final,
            } => {
                self.on_chunk_received(handle, transfer, position, &data, is_final)
                    .await
            }
            TransportEvent::FileChunkRequested {
                handle,
                transfer,
                position,
                length,
            } => {
                self.on_chunk_requested(handle, transfer, position, length)
                    .await
            }
            TransportEvent::FileControl {
                handle,
                transfer,
                is_cancel,
            } => {
                if is_cancel {
                    let dropped = self.transfers.lock().remove(handle, transfer);
                    debug!(%handle, %transfer, known = dropped.is_some(), "transfer cancelled by peer");
                } else {
                    trace!(%handle, %transfer, "ignoring non-cancel file control");
                }
            }
        }
    }

    /// Identity behind a handle, or `None` (logged) if the transport cannot say.
    async fn peer(&self, handle: SessionHandle) -> Option<PeerIdentity> {
        match self.directory.resolve_identity(&self.transport, handle).await {
            Ok(peer) => Some(peer),
            Err(err) => {
                warn!(%handle, %err, "cannot resolve peer identity");
                None
            }
        }
    }

    async fn on_self_connected(&self) {
        if let Err(err) = self.directory.refresh_all(&self.transport).await {
            warn!(%err, "directory refresh on connect failed");
        }
        *self.state.lock() = ConnectionState::Connected;
        match self.compute_address().await {
            Ok(address) => {
                *self.own_address.lock() = Some(address);
                info!(%address, "connected");
                self.notify(Notification::Connected { address });
            }
            Err(err) => error!(%err, "connected, but own address is unavailable"),
        }
    }

    fn on_self_disconnected(self: &Arc<Self>) {
        *self.state.lock() = ConnectionState::Disconnected;
        *self.own_address.lock() = None;
        self.reachability.lock().clear();
        if self.stopping.load(Ordering::SeqCst) {
            debug!("connection closed by explicit stop");
            return;
        }
        info!("lost connection");
        self.notify(Notification::Disconnected);

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect already in progress");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.reconnect().await {
                warn!(%err, "automatic reconnect failed");
                *this.state.lock() = ConnectionState::Disconnected;
            }
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        *self.state.lock() = ConnectionState::Connecting;
        self.transport.stop().await?;
        self.bootstrap().await;
        if self.stopping.load(Ordering::SeqCst) {
            debug!("stopped during reconnect");
            return Ok(());
        }
        let events = self
            .events
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Other("event channel closed".into()))?;
        self.transport.start(events).await?;
        info!("transport restarted");
        Ok(())
    }

    async fn on_friend_connection(self: &Arc<Self>, handle: SessionHandle, connected: bool) {
        let transition = self.reachability.lock().update(handle, connected);
        match transition {
            Transition::BecameOnline => {
                debug!(%handle, "peer online");
                self.spawn_drain(handle);
                self.spawn_avatar_push(handle);
            }
            Transition::BecameOffline => debug!(%handle, "peer offline"),
            Transition::Unchanged => trace!(%handle, connected, "connection report unchanged"),
        }
        if let Some(peer) = self.peer(handle).await {
            let status = if connected {
                UserStatus::Online
            } else {
                UserStatus::Offline
            };
            self.notify(Notification::PresenceChanged { peer, status });
        }
    }

    /// Try an immediate send; queue it if the transport says the peer is not
    /// connected and the tracker agrees.
    async fn deliver(&self, handle: SessionHandle, entry: QueueEntry) -> Result<(), SessionError> {
        let result = match &entry {
            QueueEntry::Message { text, is_action } => {
                self.transport.send_message(handle, text, *is_action).await
            }
            QueueEntry::File { data, filename } => self
                .offer_file(handle, FileKind::Data, filename, data.clone())
                .await
                .map(|_| ()),
        };
        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let reachable = self.reachability.lock().is_reachable(handle);
        if err == TransportError::FriendNotConnected && !reachable {
            debug!(%handle, "peer unreachable, queued");
            self.queue.lock().push(handle, entry);
            return Ok(());
        }
        Err(err.into())
    }

    async fn offer_file(
        &self,
        handle: SessionHandle,
        kind: FileKind,
        filename: &str,
        data: Bytes,
    ) -> Result<TransferId, TransportError> {
        let size = data.len() as u64;
        let _gate = self.offer_gate.lock().await;
        let transfer = self
            .transport
            .request_file_send(handle, kind, filename, size)
            .await?;
        self.transfers
            .lock()
            .register_outbound(handle, transfer, kind, filename, data);
        debug!(%handle, %transfer, size, ?kind, "file offered");
        Ok(transfer)
    }

    fn spawn_drain(self: &Arc<Self>, handle: SessionHandle) {
        if !self.queue.lock().has_queue(handle) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.pop_queue(handle).await;
        });
    }

    /// Replay the queue in FIFO order. Entries that fail as unreachable again
    /// go to the back; the pass covers only what was queued when it started.
    async fn pop_queue(&self, handle: SessionHandle) -> bool {
        let pending = {
            let mut queue = self.queue.lock();
            if !queue.begin_drain(handle) {
                trace!(%handle, "drain already running");
                return false;
            }
            queue.len(handle)
        };
        debug!(%handle, pending, "draining queue");
        for _ in 0..pending {
            let next = self.queue.lock().pop(handle);
            let Some(entry) = next else {
                break;
            };
            if let Err(err) = self.deliver(handle, entry).await {
                warn!(%handle, %err, "dropping queued entry");
            }
        }
        self.queue.lock().end_drain(handle);
        true
    }

    fn spawn_avatar_push(self: &Arc<Self>, handle: SessionHandle) {
        if !self.transfers.lock().begin_avatar_push(handle) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.push_avatar(handle).await;
        });
    }

    /// Offer the cached avatar to a peer whose push slot the caller holds, then
    /// release the slot. Repeats if the avatar changed meanwhile.
    async fn push_avatar(&self, handle: SessionHandle) {
        loop {
            let (generation, data) = {
                let avatar = self.avatar.lock().await;
                (avatar.generation(), avatar.data())
            };
            if let Some(data) = data {
                if let Err(err) = self
                    .offer_file(handle, FileKind::Avatar, AVATAR_FILENAME, data)
                    .await
                {
                    warn!(%handle, %err, "avatar push failed");
                }
            }
            // Release under the avatar lock so a concurrent set_avatar either
            // sees the slot free or has already bumped the generation.
            let avatar = self.avatar.lock().await;
            if avatar.generation() == generation {
                self.transfers.lock().end_avatar_push(handle);
                return;
            }
            debug!(%handle, "avatar changed during push, offering again");
        }
    }

    async fn on_file_offer(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        size: u64,
        kind: FileKind,
        filename: &str,
    ) {
        let registered = self
            .transfers
            .lock()
            .register_inbound(handle, transfer, kind, filename, size);
        match registered {
            Ok(()) => {}
            Err(OfferError::Duplicate) => {
                // The first offer with this id is still live; leave it alone.
                warn!(%handle, %transfer, "ignoring duplicate file offer");
                return;
            }
            Err(err) => {
                warn!(%handle, %transfer, %err, "rejecting file offer");
                if let Err(err) = self.transport.cancel_file(handle, transfer).await {
                    warn!(%handle, %transfer, %err, "failed to cancel rejected file");
                }
                return;
            }
        }
        debug!(%handle, %transfer, size, ?kind, filename, "accepting file offer");
        if let Err(err) = self.transport.accept_incoming_file(handle, transfer).await {
            warn!(%handle, %transfer, %err, "failed to accept file");
            self.transfers.lock().remove(handle, transfer);
        }
    }

    async fn on_chunk_received(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        position: u64,
        data: &[u8],
        is_final: bool,
    ) {
        let outcome = self
            .transfers
            .lock()
            .write_chunk(handle, transfer, position, data, is_final);
        match outcome {
            ChunkOutcome::Complete(file) => {
                let Some(peer) = self.peer(handle).await else {
                    return;
                };
                debug!(%handle, %transfer, size = file.size, kind = ?file.kind, "file received");
                let notification = match file.kind {
                    FileKind::Avatar => Notification::AvatarReceived { peer, file },
                    FileKind::Data => Notification::FileReceived { peer, file },
                };
                self.notify(notification);
            }
            ChunkOutcome::InProgress => trace!(%handle, %transfer, position, "chunk stored"),
            ChunkOutcome::Unknown => debug!(%handle, %transfer, "chunk for unknown transfer"),
        }
    }

    async fn on_chunk_requested(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        position: u64,
        length: usize,
    ) {
        let outcome = {
            let _gate = self.offer_gate.lock().await;
            self.transfers
                .lock()
                .read_chunk(handle, transfer, position, length)
        };
        let data = match outcome {
            ChunkRequestOutcome::Data(data) => data,
            ChunkRequestOutcome::Finished => {
                debug!(%handle, %transfer, "outbound transfer finished");
                return;
            }
            ChunkRequestOutcome::Unknown => {
                debug!(%handle, %transfer, "chunk request for unknown transfer");
                return;
            }
        };
        match self
            .transport
            .send_file_chunk(handle, transfer, position, &data)
            .await
        {
            Ok(()) => trace!(%handle, %transfer, position, len = data.len(), "chunk sent"),
            Err(TransportError::NotTransferring) => {
                debug!(%handle, %transfer, "peer no longer transferring");
                self.transfers.lock().remove(handle, transfer);
            }
            Err(err) => warn!(%handle, %transfer, %err, "failed to send chunk"),
        }
    }
}
