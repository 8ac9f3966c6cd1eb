use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the store, the transport and the node.
///
/// Every variant is scoped to a single operation or a single connection;
/// none of them is meant to take the whole process down.
#[derive(Debug, Error)]
pub enum Error {
    /// The key has no blob in the local store.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A dispatched message references a peer that is no longer registered.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// A second live connection claimed an identity that is already registered.
    #[error("peer already connected: {0}")]
    DuplicatePeer(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A control frame could not be decoded (or encoded).
    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: String, reason: String },

    #[error("node already started")]
    AlreadyStarted,
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
