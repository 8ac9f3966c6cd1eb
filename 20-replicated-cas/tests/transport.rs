use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use replicated_cas::{
    Error,
    frame::{self, ControlMessage, Frame},
    peer::Peer,
    transport::{Handshake, InboundMessage, OnPeer, TcpTransport, TransportConfig},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{Instant, sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Recorder {
    connected: Mutex<Vec<Arc<Peer>>>,
    disconnected: Mutex<Vec<String>>,
}

impl Recorder {
    async fn peer(&self) -> Result<Arc<Peer>> {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(peer) = self.connected.lock().unwrap().first().cloned() {
                return Ok(peer);
            }
            if Instant::now() > deadline {
                return Err(anyhow!("no peer connected"));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_disconnected(&self, addr: &str) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        while !self.disconnected.lock().unwrap().iter().any(|gone| gone == addr) {
            if Instant::now() > deadline {
                return Err(anyhow!("{addr} never disconnected"));
            }
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

impl OnPeer for Recorder {
    fn connected(&self, peer: Arc<Peer>) -> replicated_cas::Result<()> {
        self.connected.lock().unwrap().push(peer);
        Ok(())
    }

    fn disconnected(&self, peer: &Arc<Peer>) {
        self.disconnected.lock().unwrap().push(peer.addr().to_string());
    }
}

struct RejectAll;

#[async_trait]
impl Handshake for RejectAll {
    async fn handshake(&self, peer: &Peer) -> replicated_cas::Result<()> {
        Err(Error::HandshakeFailed {
            peer: peer.addr().to_string(),
            reason: "not on the allow list".into(),
        })
    }
}

struct RefuseAll;

impl OnPeer for RefuseAll {
    fn connected(&self, peer: Arc<Peer>) -> replicated_cas::Result<()> {
        Err(Error::DuplicatePeer(peer.addr().to_string()))
    }
}

struct Listening {
    transport: TcpTransport,
    addr: SocketAddr,
    inbound: mpsc::Receiver<InboundMessage>,
    recorder: Arc<Recorder>,
}

async fn listen(handshake: Option<Arc<dyn Handshake>>) -> Result<Listening> {
    let recorder = Arc::new(Recorder::default());
    let mut config = TransportConfig::new("127.0.0.1:0");
    config.on_peer = Some(Arc::clone(&recorder) as Arc<dyn OnPeer>);
    if let Some(handshake) = handshake {
        config.handshake = handshake;
    }

    let transport = TcpTransport::new(config);
    let inbound = transport.consume().context("inbound queue already taken")?;
    let addr = transport.listen_and_accept().await?;

    Ok(Listening {
        transport,
        addr,
        inbound,
        recorder,
    })
}

async fn next_message(inbound: &mut mpsc::Receiver<InboundMessage>) -> Result<InboundMessage> {
    timeout(WAIT, inbound.recv())
        .await
        .context("timed out waiting for inbound message")?
        .context("inbound queue closed")
}

#[tokio::test]
async fn control_frames_arrive_in_send_order() -> Result<()> {
    let mut node = listen(None).await?;
    let mut client = TcpStream::connect(node.addr).await?;
    let client_addr = client.local_addr()?.to_string();

    let messages = vec![
        ControlMessage::GetFile { key: "a".into() },
        ControlMessage::GetFile { key: "b".into() },
        ControlMessage::GetFile { key: "c".into() },
    ];
    for message in &messages {
        frame::write_control(&mut client, message).await?;
    }

    for expected in messages {
        let inbound = next_message(&mut node.inbound).await?;
        assert_eq!(inbound.from, client_addr);
        assert_eq!(inbound.message, expected);
    }

    assert!(node.transport.consume().is_none(), "queue has a single consumer");
    node.transport.close();
    Ok(())
}

#[tokio::test]
async fn frame_loop_waits_for_stream_consumer() -> Result<()> {
    let mut node = listen(None).await?;
    let mut client = TcpStream::connect(node.addr).await?;

    frame::write_control(
        &mut client,
        &ControlMessage::StoreFile {
            key: "slow".into(),
            size: 10,
        },
    )
    .await?;
    frame::write_stream_header(&mut client).await?;
    client.write_all(b"0123").await?;

    let announced = next_message(&mut node.inbound).await?;
    assert_eq!(
        announced.message,
        ControlMessage::StoreFile {
            key: "slow".into(),
            size: 10
        }
    );

    let peer = node.recorder.peer().await?;
    let mut stream = timeout(WAIT, peer.incoming_stream()).await??;
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    assert_eq!(&head, b"0123");

    // The rest of the body and a new frame are now on the wire. The frame loop
    // must not touch them while the stream is held.
    client.write_all(b"456789").await?;
    frame::write_control(&mut client, &ControlMessage::GetFile { key: "next".into() }).await?;

    assert!(
        timeout(Duration::from_millis(200), node.inbound.recv())
            .await
            .is_err(),
        "frame loop advanced during a stream read"
    );

    let mut tail = [0u8; 6];
    stream.read_exact(&mut tail).await?;
    assert_eq!(&tail, b"456789");
    drop(stream);

    let next = next_message(&mut node.inbound).await?;
    assert_eq!(next.message, ControlMessage::GetFile { key: "next".into() });

    node.transport.close();
    Ok(())
}

#[tokio::test]
async fn rejected_handshake_closes_connection() -> Result<()> {
    let node = listen(Some(Arc::new(RejectAll))).await?;
    let mut client = TcpStream::connect(node.addr).await?;

    let mut buf = [0u8; 1];
    let read = timeout(WAIT, client.read(&mut buf))
        .await
        .context("connection was not closed")??;
    assert_eq!(read, 0);
    assert!(node.recorder.connected.lock().unwrap().is_empty());

    node.transport.close();
    Ok(())
}

#[tokio::test]
async fn refused_peer_is_closed_before_any_frame() -> Result<()> {
    let mut config = TransportConfig::new("127.0.0.1:0");
    config.on_peer = Some(Arc::new(RefuseAll));
    let transport = TcpTransport::new(config);
    let mut inbound = transport.consume().context("inbound queue already taken")?;
    let addr = transport.listen_and_accept().await?;

    let mut client = TcpStream::connect(addr).await?;
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, client.read(&mut buf))
        .await
        .context("connection was not closed")??;
    assert_eq!(read, 0);

    // The connection is gone, so nothing sent now can be dispatched.
    let _ = frame::write_control(&mut client, &ControlMessage::GetFile { key: "doc".into() }).await;
    assert!(
        timeout(Duration::from_millis(200), inbound.recv())
            .await
            .is_err(),
        "a refused peer delivered a frame"
    );

    transport.close();
    Ok(())
}

#[tokio::test]
async fn dial_reports_rejected_handshake() -> Result<()> {
    let node = listen(None).await?;
    let dialer = TcpTransport::new(TransportConfig {
        listen_addr: "127.0.0.1:0".into(),
        handshake: Arc::new(RejectAll),
        on_peer: None,
    });

    let result = dialer.dial(&node.addr.to_string()).await;
    assert!(matches!(result, Err(Error::HandshakeFailed { .. })));

    node.transport.close();
    Ok(())
}

#[tokio::test]
async fn dial_tags_peers_by_direction() -> Result<()> {
    let node = listen(None).await?;
    let dialer = TcpTransport::new(TransportConfig::new("127.0.0.1:0"));

    let outbound = dialer.dial(&node.addr.to_string()).await?;
    assert!(outbound.is_outbound());
    assert_eq!(outbound.addr(), node.addr.to_string());

    let inbound = node.recorder.peer().await?;
    assert!(!inbound.is_outbound());

    dialer.close();
    node.transport.close();
    Ok(())
}

#[tokio::test]
async fn malformed_frame_drops_connection() -> Result<()> {
    let node = listen(None).await?;
    let mut client = TcpStream::connect(node.addr).await?;
    let client_addr = client.local_addr()?.to_string();

    node.recorder.peer().await?;
    client.write_u8(0x7f).await?;

    let mut buf = [0u8; 1];
    let read = timeout(WAIT, client.read(&mut buf))
        .await
        .context("connection was not closed")??;
    assert_eq!(read, 0);
    node.recorder.wait_disconnected(&client_addr).await?;

    node.transport.close();
    Ok(())
}

#[tokio::test]
async fn closing_transport_stops_frame_loops() -> Result<()> {
    let node = listen(None).await?;
    let mut client = TcpStream::connect(node.addr).await?;
    let client_addr = client.local_addr()?.to_string();
    node.recorder.peer().await?;

    node.transport.close();
    node.recorder.wait_disconnected(&client_addr).await?;

    // Our side shut down its writer, so the remote reads EOF.
    assert_eq!(read_frame_with_timeout(&mut client).await?, None);
    Ok(())
}

async fn read_frame_with_timeout(client: &mut TcpStream) -> Result<Option<Frame>> {
    Ok(timeout(WAIT, frame::read_frame(client)).await??)
}
