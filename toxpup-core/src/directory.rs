//! Peer directory: identity ↔ handle cache in front of the transport's friend list.
//!
//! Handles are only valid for the current run, so nothing here is persisted.
//! Forward lookups that miss trigger a full refresh (the transport can only
//! list peers, not look one up by key); reverse lookups go to the transport
//! one peer at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::identity::{PeerIdentity, SessionHandle};
use crate::transport::{Transport, TransportError};

/// Bidirectional identity ↔ handle mapping. Both maps always describe the same
/// bijection.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    by_identity: RwLock<HashMap<PeerIdentity, SessionHandle>>,
    by_handle: RwLock<HashMap<SessionHandle, PeerIdentity>>,
    /// Held for the duration of a refresh.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped after every completed refresh.
    generation: AtomicU64,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `identity` ↔ `handle`, dropping any stale mapping of either side.
    pub fn register(&self, identity: PeerIdentity, handle: SessionHandle) {
        let mut by_identity = self.by_identity.write();
        let mut by_handle = self.by_handle.write();

        if let Some(old_handle) = by_identity.remove(&identity) {
            by_handle.remove(&old_handle);
        }
        if let Some(old_identity) = by_handle.remove(&handle) {
            by_identity.remove(&old_identity);
        }
        by_identity.insert(identity, handle);
        by_handle.insert(handle, identity);
    }

    pub fn remove(&self, identity: &PeerIdentity) -> Option<SessionHandle> {
        let mut by_identity = self.by_identity.write();
        let mut by_handle = self.by_handle.write();

        let handle = by_identity.remove(identity)?;
        by_handle.remove(&handle);
        Some(handle)
    }

    pub fn cached_handle(&self, identity: &PeerIdentity) -> Option<SessionHandle> {
        self.by_identity.read().get(identity).copied()
    }

    pub fn cached_identity(&self, handle: SessionHandle) -> Option<PeerIdentity> {
        self.by_handle.read().get(&handle).copied()
    }

    /// Identities currently cached, sorted.
    pub fn identities(&self) -> Vec<PeerIdentity> {
        let mut ids: Vec<PeerIdentity> = self.by_identity.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_identity.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve an identity to its handle. A miss refreshes the whole directory
    /// once before giving up with [`SessionError::UnknownPeer`].
    pub async fn resolve_handle<T: Transport + ?Sized>(
        &self,
        transport: &T,
        identity: &PeerIdentity,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.cached_handle(identity) {
            return Ok(handle);
        }
        debug!(peer = %identity, "handle cache miss, refreshing directory");
        self.refresh_all(transport).await?;
        self.cached_handle(identity)
            .ok_or(SessionError::UnknownPeer(*identity))
    }

    /// Resolve a handle to its identity, asking the transport on a miss.
    pub async fn resolve_identity<T: Transport + ?Sized>(
        &self,
        transport: &T,
        handle: SessionHandle,
    ) -> Result<PeerIdentity, TransportError> {
        if let Some(identity) = self.cached_identity(handle) {
            return Ok(identity);
        }
        let identity = transport.resolve_identity(handle).await?;
        trace!(%handle, peer = %identity, "cached reverse lookup");
        self.register(identity, handle);
        Ok(identity)
    }

    /// Rebuild both maps from the transport's peer list. Calls that overlap an
    /// in-flight refresh wait for it and return without listing again.
    pub async fn refresh_all<T: Transport + ?Sized>(
        &self,
        transport: &T,
    ) -> Result<(), TransportError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            trace!("directory refresh already completed by another caller");
            return Ok(());
        }

        let handles = transport.list_peers().await?;
        let mut fresh = HashMap::with_capacity(handles.len());
        for handle in handles {
            match transport.resolve_identity(handle).await {
                Ok(identity) => {
                    fresh.insert(identity, handle);
                }
                Err(err) => warn!(%handle, %err, "skipping peer during directory refresh"),
            }
        }
        debug!(peers = fresh.len(), "directory refreshed");

        {
            let mut by_identity = self.by_identity.write();
            let mut by_handle = self.by_handle.write();
            *by_handle = fresh.iter().map(|(id, h)| (*h, *id)).collect();
            *by_identity = fresh;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Call, MockTransport};

    fn id(b: u8) -> PeerIdentity {
        PeerIdentity::from_bytes([b; 32])
    }

    #[test]
    fn register_keeps_bijection() {
        let dir = PeerDirectory::new();
        dir.register(id(1), SessionHandle(1));
        dir.register(id(2), SessionHandle(1));
        assert_eq!(dir.cached_handle(&id(1)), None);
        assert_eq!(dir.cached_handle(&id(2)), Some(SessionHandle(1)));
        assert_eq!(dir.cached_identity(SessionHandle(1)), Some(id(2)));

        dir.register(id(2), SessionHandle(7));
        assert_eq!(dir.cached_identity(SessionHandle(1)), None);
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn miss_refreshes_then_resolves() {
        let transport = MockTransport::with_peers(&[(5, id(0xaa)), (6, id(0xbb))]);
        let dir = PeerDirectory::new();
        let handle = dir.resolve_handle(&transport, &id(0xbb)).await.unwrap();
        assert_eq!(handle, SessionHandle(6));
        assert_eq!(transport.list_calls.load(Ordering::SeqCst), 1);

        // Warm cache: no second listing.
        dir.resolve_handle(&transport, &id(0xaa)).await.unwrap();
        assert_eq!(transport.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_after_refresh_fails() {
        let transport = MockTransport::with_peers(&[(5, id(0xaa))]);
        let dir = PeerDirectory::new();
        let err = dir.resolve_handle(&transport, &id(0xcc)).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownPeer(p) if p == id(0xcc)));
    }

    #[tokio::test]
    async fn reverse_lookup_is_cached() {
        let transport = MockTransport::with_peers(&[(3, id(0x33))]);
        let dir = PeerDirectory::new();
        assert_eq!(
            dir.resolve_identity(&transport, SessionHandle(3)).await.unwrap(),
            id(0x33)
        );
        assert_eq!(
            dir.resolve_identity(&transport, SessionHandle(3)).await.unwrap(),
            id(0x33)
        );
        let lookups = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::ResolveIdentity(_)))
            .count();
        assert_eq!(lookups, 1);
        // Reverse lookups also warm the forward side.
        assert_eq!(dir.cached_handle(&id(0x33)), Some(SessionHandle(3)));
    }

    #[tokio::test]
    async fn overlapping_refreshes_collapse() {
        let transport = MockTransport::with_peers(&[(1, id(1)), (2, id(2))]);
        let dir = PeerDirectory::new();
        let (a, b) = tokio::join!(dir.refresh_all(&transport), dir.refresh_all(&transport));
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dir.identities(), vec![id(1), id(2)]);

        // A later, non-overlapping refresh lists again.
        dir.refresh_all(&transport).await.unwrap();
        assert_eq!(transport.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_drops_removed_peers() {
        let transport = MockTransport::with_peers(&[(1, id(1)), (2, id(2))]);
        let dir = PeerDirectory::new();
        dir.refresh_all(&transport).await.unwrap();
        transport.state.lock().peers.remove(&SessionHandle(2));
        dir.refresh_all(&transport).await.unwrap();
        assert_eq!(dir.cached_identity(SessionHandle(2)), None);
        assert_eq!(dir.identities(), vec![id(1)]);
    }
}
