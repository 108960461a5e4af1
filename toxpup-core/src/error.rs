//! Errors returned by the public session API.

use crate::identity::{IdentityError, PeerIdentity};
use crate::transport::{FetchError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Not in the directory, even after a full refresh. Never retried or queued.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerIdentity),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}
