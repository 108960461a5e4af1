//! In-process transport. Every account opened on one [`LoopbackNetwork`] can
//! befriend the others and exchange messages and files through it, which lets
//! puppets hosted by the same daemon talk without touching the real network.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use toxpup_core::{
    BootstrapNode, EventSender, FileKind, PeerIdentity, SessionHandle, ToxAddress, TransferId,
    Transport, TransportError, TransportEvent,
};

/// Largest file chunk relayed at once.
pub const MAX_CHUNK: usize = 1371;

#[derive(Debug, thiserror::Error)]
pub enum LoopbackError {
    #[error("save file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt save file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("account {0} is already open")]
    AlreadyOpen(PeerIdentity),
}

/// Persisted account state, bincode-encoded in the puppet's save file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SaveData {
    secret: [u8; 32],
    nospam: u32,
    name: String,
    friends: BTreeMap<u32, PeerIdentity>,
}

impl SaveData {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            secret: secret.to_bytes(),
            nospam: rand::random(),
            name: String::new(),
            friends: BTreeMap::new(),
        }
    }

    fn public_key(&self) -> PeerIdentity {
        let secret = StaticSecret::from(self.secret);
        PeerIdentity::from_bytes(*X25519PublicKey::from(&secret).as_bytes())
    }
}

struct Account {
    save: SaveData,
    /// Set while started.
    events: Option<EventSender>,
    /// Friend requests received while stopped.
    pending: Vec<(PeerIdentity, String)>,
}

struct Transfer {
    sender: PeerIdentity,
    receiver: PeerIdentity,
    size: u64,
    accepted: bool,
}

#[derive(Default)]
struct Hub {
    accounts: HashMap<PeerIdentity, Account>,
    transfers: HashMap<TransferId, Transfer>,
    next_transfer: u32,
}

impl Hub {
    fn account(&self, id: &PeerIdentity) -> Result<&Account, TransportError> {
        self.accounts
            .get(id)
            .ok_or_else(|| TransportError::Other("account closed".into()))
    }

    fn account_mut(&mut self, id: &PeerIdentity) -> Result<&mut Account, TransportError> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| TransportError::Other("account closed".into()))
    }

    fn emit(&self, to: &PeerIdentity, event: TransportEvent) {
        let Some(tx) = self.accounts.get(to).and_then(|a| a.events.as_ref()) else {
            return;
        };
        if tx.send(event).is_err() {
            trace!(account = %to, "event receiver gone");
        }
    }

    fn friend(&self, owner: &PeerIdentity, handle: SessionHandle) -> Result<PeerIdentity, TransportError> {
        self.account(owner)?
            .save
            .friends
            .get(&handle.0)
            .copied()
            .ok_or(TransportError::UnknownFriend(handle))
    }

    /// Handle under which `owner` knows `peer`.
    fn handle_of(&self, owner: &PeerIdentity, peer: &PeerIdentity) -> Option<SessionHandle> {
        self.accounts.get(owner)?.save.friends.iter().find_map(|(h, id)| {
            (id == peer).then_some(SessionHandle(*h))
        })
    }

    fn started(&self, id: &PeerIdentity) -> bool {
        self.accounts.get(id).is_some_and(|a| a.events.is_some())
    }

    /// Both started and listing each other.
    fn reachable(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.started(a)
            && self.started(b)
            && self.handle_of(a, b).is_some()
            && self.handle_of(b, a).is_some()
    }

    fn reachable_friends(&self, id: &PeerIdentity) -> Vec<PeerIdentity> {
        let Some(account) = self.accounts.get(id) else {
            return Vec::new();
        };
        account
            .save
            .friends
            .values()
            .filter(|f| self.reachable(id, f))
            .copied()
            .collect()
    }

    /// Tell both ends of a friendship that its connection changed.
    fn announce(&self, a: &PeerIdentity, b: &PeerIdentity, connected: bool) {
        for (x, y) in [(a, b), (b, a)] {
            if let Some(handle) = self.handle_of(x, y) {
                self.emit(x, TransportEvent::FriendConnection { handle, connected });
            }
        }
    }

    fn add_friend_entry(&mut self, owner: &PeerIdentity, peer: PeerIdentity) -> Result<SessionHandle, TransportError> {
        let friends = &mut self.account_mut(owner)?.save.friends;
        let n = friends.len() as u32;
        let slot = (0..=n).find(|i| !friends.contains_key(i)).unwrap_or(n);
        friends.insert(slot, peer);
        Ok(SessionHandle(slot))
    }

    /// Cancel matching transfers, notifying whichever side is still listening.
    fn cancel_transfers(&mut self, matches: impl Fn(&Transfer) -> bool) {
        let ids: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|(_, t)| matches(t))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(t) = self.transfers.remove(&id) else {
                continue;
            };
            for (x, y) in [(&t.sender, &t.receiver), (&t.receiver, &t.sender)] {
                if let Some(handle) = self.handle_of(x, y) {
                    self.emit(
                        x,
                        TransportEvent::FileControl {
                            handle,
                            transfer: id,
                            is_cancel: true,
                        },
                    );
                }
            }
            debug!(transfer = %id, "transfer cancelled");
        }
    }
}

fn chunk_len(size: u64, position: u64) -> usize {
    size.saturating_sub(position).min(MAX_CHUNK as u64) as usize
}

/// Shared medium for loopback accounts.
#[derive(Default)]
pub struct LoopbackNetwork {
    hub: Mutex<Hub>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open the account stored at `save_path`, creating a fresh identity if the
    /// file does not exist yet.
    pub fn open(self: &Arc<Self>, save_path: &Path) -> Result<LoopbackTransport, LoopbackError> {
        let io_err = |source| LoopbackError::Io {
            path: save_path.to_path_buf(),
            source,
        };
        let save = match std::fs::read(save_path) {
            Ok(raw) => bincode::deserialize::<SaveData>(&raw).map_err(|source| LoopbackError::Decode {
                path: save_path.to_path_buf(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let save = SaveData::generate();
                if let Some(parent) = save_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                let raw = bincode::serialize(&save).map_err(|source| LoopbackError::Decode {
                    path: save_path.to_path_buf(),
                    source,
                })?;
                std::fs::write(save_path, raw).map_err(io_err)?;
                info!(path = %save_path.display(), "created new save");
                save
            }
            Err(err) => return Err(io_err(err)),
        };

        let id = save.public_key();
        let mut hub = self.hub.lock();
        if hub.accounts.contains_key(&id) {
            return Err(LoopbackError::AlreadyOpen(id));
        }
        hub.accounts.insert(
            id,
            Account {
                save,
                events: None,
                pending: Vec::new(),
            },
        );
        debug!(account = %id, "account opened");
        Ok(LoopbackTransport {
            network: Arc::clone(self),
            id,
            save_path: save_path.to_path_buf(),
        })
    }
}

/// One account's view of a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    id: PeerIdentity,
    save_path: PathBuf,
}

impl LoopbackTransport {
    pub fn public_key(&self) -> PeerIdentity {
        self.id
    }

    async fn persist(&self) -> Result<(), TransportError> {
        let save = self.network.hub.lock().account(&self.id)?.save.clone();
        let raw = bincode::serialize(&save).map_err(|e| TransportError::Other(e.to_string()))?;
        tokio::fs::write(&self.save_path, raw)
            .await
            .map_err(|e| TransportError::Other(format!("writing {}: {e}", self.save_path.display())))
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let mut hub = self.network.hub.lock();
        let id = self.id;
        for friend in hub.reachable_friends(&id) {
            if let Some(handle) = hub.handle_of(&friend, &id) {
                hub.emit(
                    &friend,
                    TransportEvent::FriendConnection {
                        handle,
                        connected: false,
                    },
                );
            }
        }
        hub.cancel_transfers(|t| t.sender == id || t.receiver == id);
        hub.accounts.remove(&id);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn bootstrap(&self, node: &BootstrapNode) -> Result<(), TransportError> {
        let key = hex::decode(&node.key).map_err(|_| TransportError::InvalidKey(node.key.clone()))?;
        if key.len() != 32 {
            return Err(TransportError::InvalidKey(node.key.clone()));
        }
        trace!(address = %node.address, port = node.port, "loopback ignores bootstrap node");
        Ok(())
    }

    async fn start(&self, events: EventSender) -> Result<(), TransportError> {
        let mut hub = self.network.hub.lock();
        let pending = {
            let account = hub.account_mut(&self.id)?;
            if account.events.is_some() {
                return Err(TransportError::Other("transport already started".into()));
            }
            account.events = Some(events);
            std::mem::take(&mut account.pending)
        };
        hub.emit(&self.id, TransportEvent::SelfConnection { connected: true });
        for (public_key, message) in pending {
            hub.emit(
                &self.id,
                TransportEvent::FriendRequest {
                    public_key,
                    message,
                },
            );
        }
        for friend in hub.reachable_friends(&self.id) {
            hub.announce(&self.id, &friend, true);
        }
        debug!(account = %self.id, "started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let mut hub = self.network.hub.lock();
        let id = self.id;
        let friends = hub.reachable_friends(&id);
        hub.account_mut(&id)?.events = None;
        for friend in friends {
            hub.announce(&id, &friend, false);
        }
        hub.cancel_transfers(|t| t.sender == id || t.receiver == id);
        debug!(account = %id, "stopped");
        Ok(())
    }

    async fn send_message(
        &self,
        handle: SessionHandle,
        text: &str,
        is_action: bool,
    ) -> Result<(), TransportError> {
        let hub = self.network.hub.lock();
        let peer = hub.friend(&self.id, handle)?;
        if !hub.reachable(&self.id, &peer) {
            return Err(TransportError::FriendNotConnected);
        }
        let Some(their_handle) = hub.handle_of(&peer, &self.id) else {
            return Err(TransportError::FriendNotConnected);
        };
        hub.emit(
            &peer,
            TransportEvent::FriendMessage {
                handle: their_handle,
                text: text.to_string(),
                is_action,
            },
        );
        Ok(())
    }

    async fn request_file_send(
        &self,
        handle: SessionHandle,
        kind: FileKind,
        filename: &str,
        size: u64,
    ) -> Result<TransferId, TransportError> {
        let mut hub = self.network.hub.lock();
        let peer = hub.friend(&self.id, handle)?;
        if !hub.reachable(&self.id, &peer) {
            return Err(TransportError::FriendNotConnected);
        }
        let Some(their_handle) = hub.handle_of(&peer, &self.id) else {
            return Err(TransportError::FriendNotConnected);
        };
        hub.next_transfer += 1;
        let transfer = TransferId(hub.next_transfer);
        hub.transfers.insert(
            transfer,
            Transfer {
                sender: self.id,
                receiver: peer,
                size,
                accepted: false,
            },
        );
        hub.emit(
            &peer,
            TransportEvent::FileOffer {
                handle: their_handle,
                transfer,
                size,
                kind,
                filename: filename.to_string(),
            },
        );
        Ok(transfer)
    }

    async fn send_file_chunk(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        position: u64,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut hub = self.network.hub.lock();
        let peer = hub.friend(&self.id, handle)?;
        let size = match hub.transfers.get(&transfer) {
            Some(t) if t.sender == self.id && t.receiver == peer && t.accepted => t.size,
            _ => return Err(TransportError::NotTransferring),
        };
        let their_handle = hub
            .handle_of(&peer, &self.id)
            .ok_or(TransportError::NotTransferring)?;
        let end = position + data.len() as u64;
        if data.is_empty() && end < size {
            return Err(TransportError::Other("empty chunk".into()));
        }
        let is_final = end >= size;
        hub.emit(
            &peer,
            TransportEvent::FileChunkReceived {
                handle: their_handle,
                transfer,
                position,
                data: Bytes::copy_from_slice(data),
                is_final,
            },
        );
        let (next, length) = if is_final {
            hub.transfers.remove(&transfer);
            (size, 0)
        } else {
            (end, chunk_len(size, end))
        };
        hub.emit(
            &self.id,
            TransportEvent::FileChunkRequested {
                handle,
                transfer,
                position: next,
                length,
            },
        );
        Ok(())
    }

    async fn accept_incoming_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
    ) -> Result<(), TransportError> {
        let mut hub = self.network.hub.lock();
        let peer = hub.friend(&self.id, handle)?;
        let size = match hub.transfers.get_mut(&transfer) {
            Some(t) if t.receiver == self.id && t.sender == peer => {
                t.accepted = true;
                t.size
            }
            _ => return Err(TransportError::NotTransferring),
        };
        let sender_handle = hub
            .handle_of(&peer, &self.id)
            .ok_or(TransportError::NotTransferring)?;
        if size == 0 {
            hub.transfers.remove(&transfer);
            hub.emit(
                &self.id,
                TransportEvent::FileChunkReceived {
                    handle,
                    transfer,
                    position: 0,
                    data: Bytes::new(),
                    is_final: true,
                },
            );
        }
        hub.emit(
            &peer,
            TransportEvent::FileChunkRequested {
                handle: sender_handle,
                transfer,
                position: 0,
                length: chunk_len(size, 0),
            },
        );
        Ok(())
    }

    async fn cancel_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
    ) -> Result<(), TransportError> {
        let mut hub = self.network.hub.lock();
        let peer = hub.friend(&self.id, handle)?;
        let id = self.id;
        match hub.transfers.get(&transfer) {
            Some(t)
                if (t.sender == id && t.receiver == peer)
                    || (t.sender == peer && t.receiver == id) => {}
            _ => return Err(TransportError::NotTransferring),
        }
        hub.transfers.remove(&transfer);
        if let Some(their_handle) = hub.handle_of(&peer, &id) {
            hub.emit(
                &peer,
                TransportEvent::FileControl {
                    handle: their_handle,
                    transfer,
                    is_cancel: true,
                },
            );
        }
        debug!(%transfer, "transfer cancelled locally");
        Ok(())
    }

    async fn add_friend_no_request(
        &self,
        public_key: &PeerIdentity,
    ) -> Result<SessionHandle, TransportError> {
        let handle = {
            let mut hub = self.network.hub.lock();
            if let Some(handle) = hub.handle_of(&self.id, public_key) {
                return Ok(handle);
            }
            let handle = hub.add_friend_entry(&self.id, *public_key)?;
            if hub.reachable(&self.id, public_key) {
                hub.announce(&self.id, public_key, true);
            }
            handle
        };
        self.persist().await?;
        Ok(handle)
    }

    async fn add_friend(
        &self,
        address: &ToxAddress,
        message: &str,
    ) -> Result<SessionHandle, TransportError> {
        let peer = *address.public_key();
        if peer == self.id {
            return Err(TransportError::Other("cannot befriend own address".into()));
        }
        let handle = {
            let mut hub = self.network.hub.lock();
            if hub.handle_of(&self.id, &peer).is_some() {
                return Err(TransportError::Other("friend already added".into()));
            }
            let handle = hub.add_friend_entry(&self.id, peer)?;
            let mutual = hub.handle_of(&peer, &self.id).is_some();
            let deliver = match hub.accounts.get_mut(&peer) {
                Some(target) if target.save.nospam != address.nospam() => {
                    debug!(%peer, "nospam mismatch, friend request dropped");
                    false
                }
                Some(target) if !mutual => {
                    if target.events.is_none() {
                        target.pending.push((self.id, message.to_string()));
                    }
                    true
                }
                Some(_) => false,
                None => {
                    debug!(%peer, "no such account on this network");
                    false
                }
            };
            if deliver {
                hub.emit(
                    &peer,
                    TransportEvent::FriendRequest {
                        public_key: self.id,
                        message: message.to_string(),
                    },
                );
            }
            if hub.reachable(&self.id, &peer) {
                hub.announce(&self.id, &peer, true);
            }
            handle
        };
        self.persist().await?;
        Ok(handle)
    }

    async fn delete_friend(&self, handle: SessionHandle) -> Result<(), TransportError> {
        {
            let mut hub = self.network.hub.lock();
            let peer = hub.friend(&self.id, handle)?;
            let id = self.id;
            if hub.reachable(&id, &peer) {
                if let Some(their_handle) = hub.handle_of(&peer, &id) {
                    hub.emit(
                        &peer,
                        TransportEvent::FriendConnection {
                            handle: their_handle,
                            connected: false,
                        },
                    );
                }
            }
            hub.cancel_transfers(|t| {
                (t.sender == id && t.receiver == peer) || (t.sender == peer && t.receiver == id)
            });
            hub.account_mut(&id)?.save.friends.remove(&handle.0);
        }
        self.persist().await
    }

    async fn list_peers(&self) -> Result<Vec<SessionHandle>, TransportError> {
        let hub = self.network.hub.lock();
        Ok(hub
            .account(&self.id)?
            .save
            .friends
            .keys()
            .map(|h| SessionHandle(*h))
            .collect())
    }

    async fn resolve_identity(
        &self,
        handle: SessionHandle,
    ) -> Result<PeerIdentity, TransportError> {
        self.network.hub.lock().friend(&self.id, handle)
    }

    async fn friend_name(&self, handle: SessionHandle) -> Result<String, TransportError> {
        let hub = self.network.hub.lock();
        let peer = hub.friend(&self.id, handle)?;
        Ok(hub
            .accounts
            .get(&peer)
            .map(|a| a.save.name.clone())
            .unwrap_or_default())
    }

    async fn own_public_key(&self) -> Result<PeerIdentity, TransportError> {
        Ok(self.id)
    }

    async fn own_nospam(&self) -> Result<u32, TransportError> {
        Ok(self.network.hub.lock().account(&self.id)?.save.nospam)
    }

    async fn own_name(&self) -> Result<String, TransportError> {
        Ok(self.network.hub.lock().account(&self.id)?.save.name.clone())
    }

    async fn set_own_name(&self, name: &str) -> Result<(), TransportError> {
        {
            let mut hub = self.network.hub.lock();
            hub.account_mut(&self.id)?.save.name = name.to_string();
            for friend in hub.reachable_friends(&self.id) {
                if let Some(handle) = hub.handle_of(&friend, &self.id) {
                    hub.emit(&friend, TransportEvent::FriendName { handle });
                }
            }
        }
        self.persist().await
    }
}
