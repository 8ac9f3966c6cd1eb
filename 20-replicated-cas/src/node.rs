//! Replication coordinator.
//!
//! A [`Node`] owns the local [`BlobStore`], the [`TcpTransport`] and the
//! registry of connected peers. Stores are written locally and then pushed to
//! every peer; gets are answered locally when possible and otherwise asked of
//! the network. Inbound control messages are handled one at a time by a
//! single dispatch task.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::ControlMessage;
use crate::path::PathTransform;
use crate::peer::Peer;
use crate::store::BlobStore;
use crate::transport::{
    Handshake, InboundMessage, NoHandshake, OnPeer, TcpTransport, TransportConfig,
};

pub struct NodeConfig {
    /// Address to listen on, e.g. `127.0.0.1:3000`. Port 0 picks one.
    pub listen_addr: String,
    /// Root directory of the local blob store.
    pub root: PathBuf,
    pub transform: PathTransform,
    /// Peers dialed by `start`.
    pub bootstrap: Vec<String>,
    pub handshake: Arc<dyn Handshake>,
}

impl NodeConfig {
    pub fn new(listen_addr: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            root: root.into(),
            transform: PathTransform::default(),
            bootstrap: Vec::new(),
            handshake: Arc::new(NoHandshake),
        }
    }
}

/// Result of [`Node::get`].
pub enum Fetch {
    /// The blob was stored locally.
    Local { size: u64, file: File },
    /// A `GetFile` went out; the blob arrives through a peer's `StoreFile`.
    Remote(RemoteFetch),
}

/// A pending network retrieval.
pub struct RemoteFetch {
    key: String,
    store: BlobStore,
    ready: oneshot::Receiver<()>,
}

impl RemoteFetch {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits until some peer delivered the key, then opens the local replica.
    ///
    /// Never times out on its own; wrap it in `tokio::time::timeout`.
    pub async fn wait(self) -> Result<(u64, File)> {
        self.ready
            .await
            .map_err(|_| Error::NotFound(self.key.clone()))?;
        self.store.read(&self.key).await
    }
}

pub struct Node {
    store: BlobStore,
    transport: TcpTransport,
    peers: Arc<PeerRegistry>,
    pending: PendingFetches,
    bootstrap: Vec<String>,
    quit: watch::Sender<bool>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let peers = Arc::new(PeerRegistry::default());
        let transport = TcpTransport::new(TransportConfig {
            listen_addr: config.listen_addr,
            handshake: config.handshake,
            on_peer: Some(Arc::clone(&peers) as Arc<dyn OnPeer>),
        });
        let (quit, _) = watch::channel(false);

        Arc::new(Self {
            store: BlobStore::new(config.root, config.transform),
            transport,
            peers,
            pending: PendingFetches::default(),
            bootstrap: config.bootstrap,
            quit,
        })
    }

    /// Binds the listener, spawns the dispatch loop and dials the bootstrap
    /// peers. Returns the bound address.
    ///
    /// A bind failure is returned; a failed dial is logged and skipped.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let inbound = self.transport.consume().ok_or(Error::AlreadyStarted)?;
        let addr = self.transport.listen_and_accept().await?;

        tokio::spawn(Arc::clone(self).dispatch_loop(inbound));

        for peer in &self.bootstrap {
            if let Err(err) = self.transport.dial(peer).await {
                warn!(%peer, error = %err, "failed to dial bootstrap peer");
            }
        }

        info!(%addr, root = %self.store.root().display(), "node started");
        Ok(addr)
    }

    /// [`start`](Self::start), then wait until [`shutdown`](Self::shutdown).
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        self.start().await?;
        let mut quit = self.quit.subscribe();
        let _ = quit.wait_for(|quit| *quit).await;
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.store
    }

    /// Dials a peer after startup.
    pub async fn connect(&self, addr: &str) -> Result<Arc<Peer>> {
        self.transport.dial(addr).await
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Identities of the registered peers, in broadcast order.
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.ids()
    }

    /// Writes `source` locally, then pushes it to every registered peer.
    ///
    /// Returns the number of bytes stored. Only the local write can fail the
    /// call; peers that cannot be reached are logged and skipped.
    pub async fn store<R>(&self, key: &str, source: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffered = Vec::new();
        let size = self.store.write(key, Tee::new(source, &mut buffered)).await?;

        for peer in self.peers.snapshot() {
            if let Err(err) = peer.send_file(key, size, buffered.as_slice()).await {
                warn!(peer = %peer.addr(), key, error = %err, "failed to replicate blob");
            }
        }

        info!(key, bytes = size, "blob stored");
        Ok(size)
    }

    /// Opens `key` locally, or asks every peer for it.
    ///
    /// Fails with `NotFound` when the key is missing and no peer is connected.
    pub async fn get(&self, key: &str) -> Result<Fetch> {
        // Registered before the local check: a StoreFile finishing in between
        // either shows up locally or resolves this waiter.
        let ready = self.pending.register(key);

        if self.store.has(key).await? {
            let (size, file) = self.store.read(key).await?;
            return Ok(Fetch::Local { size, file });
        }

        if self.peers.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }

        self.broadcast(&ControlMessage::GetFile {
            key: key.to_string(),
        })
        .await;

        debug!(key, "blob requested from peers");
        Ok(Fetch::Remote(RemoteFetch {
            key: key.to_string(),
            store: self.store.clone(),
            ready,
        }))
    }

    /// Whether `key` is stored locally.
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.store.has(key).await
    }

    /// Removes the local copy of `key`. Peers keep theirs.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await
    }

    /// Wipes the local store.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Sends one control message to every registered peer.
    pub async fn broadcast(&self, message: &ControlMessage) {
        for peer in self.peers.snapshot() {
            if let Err(err) = peer.send_control(message).await {
                warn!(peer = %peer.addr(), error = %err, "failed to broadcast message");
            }
        }
    }

    /// Handles one control message received from `from`.
    pub async fn handle(&self, from: &str, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::StoreFile { key, size } => self.handle_store_file(from, key, size).await,
            ControlMessage::GetFile { key } => self.handle_get_file(from, key).await,
        }
    }

    /// Stops dispatching and closes the transport. Transfers in flight are
    /// cut off, pending remote fetches fail.
    pub async fn shutdown(&self) {
        self.quit.send_replace(true);
        self.transport.close();
        for peer in self.peers.drain() {
            peer.close().await;
        }
        self.pending.clear();
        info!("node shut down");
    }

    async fn handle_store_file(&self, from: &str, key: String, size: u64) -> Result<()> {
        let peer = self.peer(from)?;
        let mut stream = peer.incoming_stream().await?;
        let mut body = (&mut stream).take(size);

        let written = match self.store.write(&key, &mut body).await {
            Ok(written) => written,
            Err(err) => {
                // Keep the connection aligned on a frame boundary.
                tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
                return Err(err);
            }
        };
        drop(stream);

        if written != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{from} sent {written} of {size} bytes for {key}"),
            )));
        }

        debug!(peer = %from, key = %key, bytes = written, "replica stored");
        self.pending.resolve(&key);
        Ok(())
    }

    async fn handle_get_file(&self, from: &str, key: String) -> Result<()> {
        let peer = self.peer(from)?;
        if !self.store.has(&key).await? {
            return Err(Error::NotFound(key));
        }
        let (size, file) = self.store.read(&key).await?;

        // Off the dispatch task: the requester may be pushing to us at the same time.
        tokio::spawn(async move {
            if let Err(err) = peer.send_file(&key, size, file).await {
                warn!(peer = %peer.addr(), key = %key, error = %err, "failed to serve blob");
            }
        });
        Ok(())
    }

    fn peer(&self, id: &str) -> Result<Arc<Peer>> {
        self.peers
            .get(id)
            .ok_or_else(|| Error::PeerNotFound(id.to_string()))
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        let mut quit = self.quit.subscribe();
        loop {
            let next = select! {
                _ = quit.wait_for(|quit| *quit) => break,
                next = inbound.recv() => next,
            };
            let Some(InboundMessage { from, message }) = next else {
                break;
            };

            debug!(peer = %from, ?message, "dispatching");
            select! {
                _ = quit.wait_for(|quit| *quit) => break,
                result = self.handle(&from, message) => {
                    if let Err(err) = result {
                        warn!(peer = %from, error = %err, "failed to handle message");
                    }
                }
            }
        }

        self.transport.close();
        debug!("dispatch loop stopped");
    }
}

/// Connected peers keyed by remote address.
///
/// Sorted so broadcasts always walk peers in the same order.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Peer>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.lock().get(id).cloned()
    }

    /// Copies the current peers so no lock is held during network I/O.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.lock().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn drain(&self) -> Vec<Arc<Peer>> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }
}

impl OnPeer for PeerRegistry {
    /// Frames are dispatched by identity, so only one live connection may
    /// hold it. A second one is refused and the transport closes it.
    fn connected(&self, peer: Arc<Peer>) -> Result<()> {
        let mut peers = self.lock();
        match peers.entry(peer.addr().to_string()) {
            Entry::Occupied(existing) => Err(Error::DuplicatePeer(existing.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(peer);
                Ok(())
            }
        }
    }

    fn disconnected(&self, peer: &Arc<Peer>) {
        let mut peers = self.lock();
        // Only the connection that holds the entry may remove it.
        if peers
            .get(peer.addr())
            .is_some_and(|current| Arc::ptr_eq(current, peer))
        {
            peers.remove(peer.addr());
        }
    }
}

/// Callers of `get` waiting for a key to arrive from the network.
#[derive(Default)]
struct PendingFetches {
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl PendingFetches {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<oneshot::Sender<()>>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a waiter for `key`. Waiters whose `RemoteFetch` was dropped are
    /// pruned on the way.
    fn register(&self, key: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        waiters.retain(|_, senders| {
            senders.retain(|sender| !sender.is_closed());
            !senders.is_empty()
        });
        waiters.entry(key.to_string()).or_default().push(tx);
        rx
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn resolve(&self, key: &str) {
        let waiters = self.lock().remove(key).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Copies everything read from `inner` into `copy`.
struct Tee<'a, R> {
    inner: R,
    copy: &'a mut Vec<u8>,
}

impl<'a, R> Tee<'a, R> {
    fn new(inner: R, copy: &'a mut Vec<u8>) -> Self {
        Self { inner, copy }
    }
}

impl<R> AsyncRead for Tee<'_, R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.copy.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tee_buffers_what_it_reads() {
        let mut copy = Vec::new();
        let mut sink = Vec::new();
        let mut tee = Tee::new(&b"inside file"[..], &mut copy);
        tokio::io::copy(&mut tee, &mut sink).await.unwrap();

        assert_eq!(sink, b"inside file");
        assert_eq!(copy, b"inside file");
    }

    #[tokio::test]
    async fn resolving_a_key_wakes_every_waiter() {
        let pending = PendingFetches::default();
        let first = pending.register("doc");
        let second = pending.register("doc");
        let other = pending.register("other");

        pending.resolve("doc");

        first.await.expect("first waiter resolved");
        second.await.expect("second waiter resolved");
        pending.clear();
        assert!(other.await.is_err());
    }

    #[test]
    fn dropped_fetches_do_not_accumulate() {
        let pending = PendingFetches::default();
        for i in 0..1000 {
            drop(pending.register(&format!("missing-{i}")));
        }
        assert_eq!(pending.len(), 1);

        let live = pending.register("live");
        assert_eq!(pending.len(), 1);
        drop(live);
        pending.register("next");
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn get_of_local_blob_leaves_no_waiter() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = Node::new(NodeConfig::new("127.0.0.1:0", dir.path()));
        node.blobs().write("doc", &b"inside file"[..]).await.unwrap();

        let fetch = node.get("doc").await.unwrap();
        assert!(matches!(fetch, Fetch::Local { size: 11, .. }));

        node.pending.register("other");
        assert_eq!(node.pending.len(), 1, "waiter from the local hit was pruned");
    }

    async fn dial(addr: &str) -> Arc<Peer> {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        Arc::new(Peer::new(stream, true).unwrap())
    }

    #[tokio::test]
    async fn registry_refuses_a_second_connection_under_one_identity() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let first = dial(&addr).await;
        let second = dial(&addr).await;

        let registry = PeerRegistry::default();
        registry.connected(Arc::clone(&first)).unwrap();
        let refused = registry.connected(Arc::clone(&second));
        assert!(matches!(refused, Err(Error::DuplicatePeer(id)) if id == addr));
        assert!(Arc::ptr_eq(&registry.get(&addr).unwrap(), &first));

        // The refused connection going away must not evict the live one.
        registry.disconnected(&second);
        assert_eq!(registry.len(), 1);

        registry.disconnected(&first);
        assert!(registry.is_empty());
        registry.connected(second).unwrap();
        assert_eq!(registry.len(), 1);
    }
}
