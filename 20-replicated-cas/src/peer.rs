//! A live connection to a remote node.
//!
//! The read half is shared by two parties: the transport's frame loop and,
//! for the duration of one stream body, whoever consumes that body. A
//! [`ReadGate`] makes sure only one of them reads at a time:
//!
//! 1. The frame loop reads a STREAM tag and bumps the gate's pending count.
//! 2. The consumer waits for a pending stream, takes the reader and reads
//!    exactly the declared number of bytes.
//! 3. Dropping the [`IncomingStream`] decrements the count; the frame loop
//!    only reads again once it is back to zero.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::{self, ControlMessage, Frame};

pub struct Peer {
    addr: String,
    outbound: bool,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    streams: ReadGate,
}

impl Peer {
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            outbound,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            streams: ReadGate::new(),
        })
    }

    /// Remote address; used as the peer's identity in the registry.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// `true` when this side dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        frame::write_control(&mut *writer, message).await
    }

    /// Sends `StoreFile{key, size}` followed by a STREAM frame carrying
    /// exactly `size` bytes of `body`.
    ///
    /// Both frames go out under one writer lock so nothing else can land
    /// between them.
    pub async fn send_file<R>(&self, key: &str, size: u64, body: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let announce = ControlMessage::StoreFile {
            key: key.to_string(),
            size,
        };

        let mut writer = self.writer.lock().await;
        frame::write_control(&mut *writer, &announce).await?;
        frame::write_stream_header(&mut *writer).await?;
        let copied = tokio::io::copy(&mut body.take(size), &mut *writer).await?;
        writer.flush().await?;

        if copied != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream for {key} ended after {copied} of {size} bytes"),
            )));
        }
        debug!(peer = %self.addr, key, bytes = size, "stream sent");
        Ok(())
    }

    /// Waits for the frame loop to hand over a stream body and takes the
    /// read half until the returned guard is dropped.
    pub async fn incoming_stream(&self) -> Result<IncomingStream<'_>> {
        if !self.streams.wait_pending().await {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("{} closed before its stream arrived", self.addr),
            )));
        }
        let reader = self.reader.lock().await;
        Ok(IncomingStream {
            reader,
            gate: &self.streams,
        })
    }

    /// Shuts down the write half. The remote sees EOF.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(peer = %self.addr, ?error, "failed to shut down peer writer");
        }
    }

    /// Reads the next frame header for the frame loop. A STREAM tag marks the
    /// gate before the reader is released.
    pub(crate) async fn read_frame(&self) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock().await;
        let frame = frame::read_frame(&mut *reader).await?;
        if matches!(frame, Some(Frame::Stream)) {
            self.streams.add();
        }
        Ok(frame)
    }

    /// Blocks the frame loop until every handed-off stream was consumed.
    pub(crate) async fn wait_streams_released(&self) {
        self.streams.wait_idle().await;
    }

    /// Marks the connection as finished so stream consumers stop waiting.
    pub(crate) fn mark_closed(&self) {
        self.streams.close();
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// Exclusive access to a peer's read half for one stream body.
///
/// Read at most the size announced by the matching `StoreFile`
/// (`AsyncReadExt::take`). Dropping it releases the frame loop.
pub struct IncomingStream<'a> {
    reader: MutexGuard<'a, BufReader<OwnedReadHalf>>,
    gate: &'a ReadGate,
}

impl AsyncRead for IncomingStream<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.reader).poll_read(cx, buf)
    }
}

impl Drop for IncomingStream<'_> {
    fn drop(&mut self) {
        self.gate.done();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct GateState {
    pending: usize,
    closed: bool,
}

/// Counter of stream bodies handed off by the frame loop and not yet consumed.
pub(crate) struct ReadGate {
    state: watch::Sender<GateState>,
}

impl ReadGate {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self { state }
    }

    pub(crate) fn add(&self) {
        self.state.send_modify(|state| state.pending += 1);
    }

    pub(crate) fn done(&self) {
        self.state
            .send_modify(|state| state.pending = state.pending.saturating_sub(1));
    }

    pub(crate) fn close(&self) {
        self.state.send_modify(|state| state.closed = true);
    }

    /// Resolves once nothing is pending, or the connection is closed.
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.pending == 0 || state.closed).await;
    }

    /// Resolves `true` once a stream is pending, `false` if the connection
    /// closed first.
    pub(crate) async fn wait_pending(&self) -> bool {
        let mut rx = self.state.subscribe();
        let ready = match rx.wait_for(|state| state.pending > 0 || state.closed).await {
            Ok(state) => state.pending > 0,
            Err(_) => false,
        };
        ready
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.state.borrow().pending
    }
}
