//! TCP transport: accept loop, dialing, per-connection frame loops.
//!
//! Every connection, inbound or outbound, goes through the same setup:
//! handshake, `OnPeer::connected`, then a frame loop that decodes CONTROL
//! frames onto one shared inbound queue. STREAM frames are not decoded here;
//! the loop parks until the body has been consumed through
//! [`Peer::incoming_stream`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{ControlMessage, Frame};
use crate::peer::Peer;

/// Capacity of the shared inbound queue.
const INBOUND_CAPACITY: usize = 128;

/// Validation step run on every new connection before any frame is read.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    async fn handshake(&self, peer: &Peer) -> Result<()>;
}

/// Accepts every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn handshake(&self, _peer: &Peer) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle hooks for handshaken connections.
pub trait OnPeer: Send + Sync + 'static {
    /// Called once the handshake succeeded. An error closes the connection.
    fn connected(&self, peer: Arc<Peer>) -> Result<()>;

    /// Called after the peer's frame loop terminated.
    fn disconnected(&self, _peer: &Arc<Peer>) {}
}

/// A decoded control message and the identity of the peer that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: String,
    pub message: ControlMessage,
}

pub struct TransportConfig {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub on_peer: Option<Arc<dyn OnPeer>>,
}

impl TransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NoHandshake),
            on_peer: None,
        }
    }
}

pub struct TcpTransport {
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    local_addr: OnceLock<SocketAddr>,
}

struct Shared {
    handshake: Arc<dyn Handshake>,
    on_peer: Option<Arc<dyn OnPeer>>,
    listen_addr: String,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                handshake: config.handshake,
                on_peer: config.on_peer,
                listen_addr: config.listen_addr,
                inbound,
                shutdown,
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            local_addr: OnceLock::new(),
        }
    }

    /// Address the listener is bound to, once `listen_and_accept` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Binds the listen address and spawns the accept loop.
    ///
    /// Bind errors are returned; errors accepting a single connection are
    /// logged and the loop keeps going.
    pub async fn listen_and_accept(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.shared.listen_addr).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        info!(%addr, "transport listening");

        tokio::spawn(accept_loop(listener, Arc::clone(&self.shared)));
        Ok(addr)
    }

    /// Connects to `addr`, runs the handshake and the `connected` hook, then
    /// spawns the connection's frame loop.
    pub async fn dial(&self, addr: &str) -> Result<Arc<Peer>> {
        let stream = TcpStream::connect(addr).await?;
        let peer = self.shared.setup_peer(stream, true).await?;
        tokio::spawn(Arc::clone(&self.shared).read_loop(Arc::clone(&peer)));
        Ok(peer)
    }

    /// Takes the receiving end of the inbound queue. There is a single
    /// consumer; later calls return `None`.
    pub fn consume(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Stops the accept loop and every frame loop. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                debug!("accept loop stopped");
                break;
            }
            accept_result = listener.accept() => {
                handle_accept_result(accept_result, &shared);
            }
        }
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, shared: &Arc<Shared>) {
    match result {
        Ok((stream, addr)) => spawn_inbound_handler(stream, addr, shared),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_inbound_handler(stream: TcpStream, addr: SocketAddr, shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        match shared.setup_peer(stream, false).await {
            Ok(peer) => shared.read_loop(peer).await,
            Err(err) => warn!(peer = %addr, error = %err, "dropping inbound connection"),
        }
    });
}

impl Shared {
    /// Handshake plus `connected` hook. On failure the connection is dropped
    /// and never registered.
    async fn setup_peer(&self, stream: TcpStream, outbound: bool) -> Result<Arc<Peer>> {
        let peer = Arc::new(Peer::new(stream, outbound)?);

        if let Err(err) = self.handshake.handshake(&peer).await {
            peer.close().await;
            return Err(Error::HandshakeFailed {
                peer: peer.addr().to_string(),
                reason: err.to_string(),
            });
        }

        if let Some(on_peer) = &self.on_peer {
            if let Err(err) = on_peer.connected(Arc::clone(&peer)) {
                peer.close().await;
                return Err(err);
            }
        }

        info!(peer = %peer.addr(), outbound, "peer connected");
        Ok(peer)
    }

    /// Decodes CONTROL frames from one peer until the connection ends.
    async fn read_loop(self: Arc<Self>, peer: Arc<Peer>) {
        let mut shutdown = self.shutdown.subscribe();
        let result = loop {
            let frame = select! {
                _ = shutdown.wait_for(|stop| *stop) => break Ok(()),
                frame = peer.read_frame() => frame,
            };

            match frame {
                Ok(Some(Frame::Control(message))) => {
                    let inbound = InboundMessage {
                        from: peer.addr().to_string(),
                        message,
                    };
                    if self.inbound.send(inbound).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(Some(Frame::Stream)) => {
                    select! {
                        _ = shutdown.wait_for(|stop| *stop) => break Ok(()),
                        _ = peer.wait_streams_released() => {}
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(()) => debug!(peer = %peer.addr(), "frame loop finished"),
            Err(err) => warn!(peer = %peer.addr(), error = %err, "frame loop terminated"),
        }

        peer.mark_closed();
        if let Some(on_peer) = &self.on_peer {
            on_peer.disconnected(&peer);
        }
        peer.close().await;
        info!(peer = %peer.addr(), "peer disconnected");
    }
}
