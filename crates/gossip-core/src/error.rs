//! Error taxonomy shared by the directory and the nodes.
//!
//! Only failure to bind a listening socket at startup is fatal to a process.
//! Everything here is fatal to at most one connection or one message.

use crate::wire::{PeerAddress, WireError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection refused, reset or closed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed line or unparsable HELLO port; the offending connection is dropped.
    #[error("protocol error: {0}")]
    Protocol(WireError),

    /// A name claim collided with another peer or the local node.
    #[error("name {name:?} is already taken")]
    IdentityConflict { name: String },

    /// An inbound HELLO could not be matched to a known peer after all retries.
    #[error("unresolved peer {address}")]
    UnresolvedPeer { address: PeerAddress },
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => Error::Transport(io),
            WireError::ConnectionClosed => Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )),
            other => Error::Protocol(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
