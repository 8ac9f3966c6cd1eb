//! Peer-to-peer replicated content-addressable blob store.
//!
//! Nodes keep blobs on disk under a hash-derived directory layout and push
//! every store to their connected peers over a framed TCP protocol. Each
//! module focuses on one layer:
//!
//! - [`path`] maps keys to sharded on-disk locations (the part peers must
//!   agree on).
//! - [`store`] persists blobs below a root directory.
//! - [`frame`] defines the CONTROL/STREAM framing and the control messages.
//! - [`peer`] wraps one connection and the hand-off of its read half between
//!   the frame loop and stream consumers.
//! - [`transport`] accepts and dials connections and runs the frame loops.
//! - [`node`] ties it together: peer registry, store/get, message dispatch.
//! - [`cli`] parses the command line of the `replicated-cas` binary.
//!
//! Integration tests drive real nodes over localhost TCP.

pub mod cli;
pub mod error;
pub mod frame;
pub mod node;
pub mod path;
pub mod peer;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
pub use node::{Fetch, Node, NodeConfig, RemoteFetch};
pub use path::{KeyPath, PathTransform};
pub use store::BlobStore;
