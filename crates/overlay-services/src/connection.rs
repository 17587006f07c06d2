//! Framed TCP connections.
//!
//! Each connection is split in two. The write half is owned by a writer task
//! that drains an unbounded channel, so any number of tasks can send through
//! a cloned [`Connection`] without interleaving partial frames. The read half
//! is a [`FrameReader`] owned by whichever task serves the connection.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use overlay_core::wire::{FrameHeader, HEADER_LEN};
use overlay_core::{Message, WireError};

use crate::peer::Link;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {0} closed")]
    Closed(SocketAddr),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Bad header. The stream position is lost, so the connection is done.
    #[error("framing error: {0}")]
    Framing(WireError),
    /// Whole frame read but the payload did not decode. The stream is still
    /// in sync and the next frame can be read.
    #[error("malformed {tag} frame: {source}")]
    Malformed { tag: u8, source: WireError },
}

impl ConnectionError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConnectionError::Malformed { .. })
    }
}

/// Sending half. Cheap to clone; all clones feed the same writer task.
#[derive(Debug, Clone)]
pub struct Connection {
    remote: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    /// Split an established stream and start its writer task.
    pub fn spawn(stream: TcpStream) -> io::Result<(Connection, FrameReader)> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(
            FrameWriter {
                remote,
                half: write_half,
                rx,
            }
            .run(),
        );

        Ok((
            Connection { remote, tx },
            FrameReader {
                remote,
                half: read_half,
            },
        ))
    }

    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<(Connection, FrameReader)> {
        let stream = TcpStream::connect(addr).await?;
        Self::spawn(stream)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue a message for the writer task.
    pub fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.tx
            .send(message)
            .map_err(|_| ConnectionError::Closed(self.remote))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Link for Connection {
    fn send(&self, message: Message) -> anyhow::Result<()> {
        Connection::send(self, message)?;
        Ok(())
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

struct FrameWriter {
    remote: SocketAddr,
    half: OwnedWriteHalf,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl FrameWriter {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            let frame = message.encode();
            if let Err(e) = self.half.write_all(&frame).await {
                tracing::warn!(remote = %self.remote, error = %e, kind = message.kind(), "write failed");
                break;
            }
            tracing::trace!(remote = %self.remote, kind = message.kind(), "frame sent");
        }
        // closing the receiver makes further sends fail fast
        self.rx.close();
        let _ = self.half.shutdown().await;
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct FrameReader {
    remote: SocketAddr,
    half: OwnedReadHalf,
}

impl FrameReader {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Next decoded message, or `None` on a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<Message>, ConnectionError> {
        let mut header = [0u8; HEADER_LEN];
        match self.half.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let (tag, len) = FrameHeader::parse(&header).map_err(ConnectionError::Framing)?;

        let mut payload = BytesMut::zeroed(len);
        self.half.read_exact(&mut payload).await?;

        let message = Message::decode(tag, &payload)
            .map_err(|source| ConnectionError::Malformed { tag, source })?;
        tracing::trace!(remote = %self.remote, kind = message.kind(), "frame received");
        Ok(Some(message))
    }
}
