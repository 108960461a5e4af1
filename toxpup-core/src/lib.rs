//! Per-account session manager for the Tox puppet bridge.
//! No I/O of its own: the transport and the fetcher are injected by the host.

pub mod directory;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod queue;
pub mod reachability;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::SessionError;
pub use identity::{IdentityError, PeerIdentity, SessionHandle, ToxAddress, TransferId};
pub use protocol::{FileKind, Notification, TransportEvent, UserStatus};
pub use session::{ConnectionState, Session, SessionConfig};
pub use transfer::FileTransfer;
pub use transport::{
    BootstrapNode, EventSender, FetchError, Fetcher, Transport, TransportError,
};
