//! Diameter transport layer (TCP)
//!
//! Provides TCP-based transport for Diameter messages per RFC 6733 Section 2.1.
//! Framing uses the 3-byte length field that follows the version byte.
//!
//! A connection starts as a [`DiameterTransport`] for the capabilities
//! exchange and is then split into a [`FrameReader`] owned by the peer's
//! reader task and a [`FrameWriter`] owned by its writer task.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{DiameterError, DiameterResult};
use crate::message::{DiameterMessage, DIAMETER_HEADER_SIZE};

/// Maximum accepted Diameter message size
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Reading half of a Diameter connection
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
    read_buf: BytesMut,
}

impl FrameReader {
    /// Receive the next complete message.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn recv(&mut self) -> DiameterResult<DiameterMessage> {
        loop {
            if let Some(msg) = self.try_parse_message()? {
                return Ok(msg);
            }

            let n = self.half.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(DiameterError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    fn try_parse_message(&mut self) -> DiameterResult<Option<DiameterMessage>> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let msg_len = ((self.read_buf[1] as usize) << 16)
            | ((self.read_buf[2] as usize) << 8)
            | self.read_buf[3] as usize;

        if msg_len < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {msg_len} is less than header size"
            )));
        }
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {msg_len} exceeds maximum {MAX_MESSAGE_SIZE}"
            )));
        }
        if self.read_buf.len() < msg_len {
            self.read_buf.reserve(msg_len - self.read_buf.len());
            return Ok(None);
        }

        let mut frame = self.read_buf.split_to(msg_len).freeze();
        DiameterMessage::decode(&mut frame).map(Some)
    }
}

/// Writing half of a Diameter connection
#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send(&mut self, msg: &DiameterMessage) -> DiameterResult<()> {
        let encoded = msg.encode();
        self.half.write_all(&encoded).await?;
        self.half.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> DiameterResult<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

/// Diameter transport connection wrapping a TCP stream
#[derive(Debug)]
pub struct DiameterTransport {
    reader: FrameReader,
    writer: FrameWriter,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl DiameterTransport {
    pub fn new(stream: TcpStream) -> DiameterResult<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader {
                half: read_half,
                read_buf: BytesMut::with_capacity(4096),
            },
            writer: FrameWriter { half: write_half },
            peer_addr,
            local_addr,
        })
    }

    pub async fn connect(addr: SocketAddr) -> DiameterResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream)
    }

    /// Connect, giving up after `timeout`
    pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> DiameterResult<Self> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => Self::new(stream?),
            Err(_) => Err(DiameterError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            ))),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&mut self, msg: &DiameterMessage) -> DiameterResult<()> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> DiameterResult<DiameterMessage> {
        self.reader.recv().await
    }

    pub async fn shutdown(&mut self) -> DiameterResult<()> {
        self.writer.shutdown().await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Diameter TCP listener that accepts incoming connections
pub struct DiameterListener {
    listener: TcpListener,
}

impl DiameterListener {
    pub async fn bind(addr: SocketAddr) -> DiameterResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> DiameterResult<DiameterTransport> {
        let (stream, _addr) = self.listener.accept().await?;
        DiameterTransport::new(stream)
    }

    pub fn local_addr(&self) -> DiameterResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
