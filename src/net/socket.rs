//! Buffered async socket
//!
//! Wraps a tokio `TcpStream` with an inbound `ByteBuffer` so callers can
//! accumulate partial reads until a full protocol frame is present.
//! Transport failures surface as `NetworkError` values rather than
//! terminating the process.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::net::buffer::ByteBuffer;

/// Size of the chunk read from the transport per `recv` call
const RECV_CHUNK: usize = 16 * 1024;

/// An asynchronous bidirectional byte stream with inbound buffering.
///
/// Writes queued on the same socket are delivered complete and in order;
/// `send` does not return until the payload is handed to the transport.
pub struct Socket {
    stream: TcpStream,
    peer_addr: SocketAddr,
    inbound: ByteBuffer,
    closed: bool,
}

impl Socket {
    /// Connect to a remote address, bounded by `connect_timeout`
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        debug!("Connecting to {}", addr);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", addr);
                TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;
        Self::from_stream(stream)
    }

    /// Wrap an already-established stream (incoming connection)
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TorrentError::network_error_full("Failed to get peer address", "unknown".to_string(), e.to_string()))?;
        Ok(Self {
            stream,
            peer_addr,
            inbound: ByteBuffer::new(),
            closed: false,
        })
    }

    /// Remote address of the connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send a complete payload, in order relative to prior sends
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("Sending {} bytes to {}", bytes.len(), self.peer_addr);
        self.stream.write_all(bytes).await.map_err(|e| {
            TorrentError::network_error_full("Write failed", self.peer_addr.to_string(), e.to_string())
        })?;
        self.stream.flush().await.map_err(|e| {
            TorrentError::network_error_full("Flush failed", self.peer_addr.to_string(), e.to_string())
        })?;
        Ok(())
    }

    /// Read the next available chunk into the inbound buffer.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed
    /// the connection.
    pub async fn recv(&mut self) -> Result<usize> {
        let mut chunk = [0u8; RECV_CHUNK];
        let n = self.stream.read(&mut chunk).await.map_err(|e| {
            TorrentError::network_error_full("Read failed", self.peer_addr.to_string(), e.to_string())
        })?;
        if n == 0 {
            debug!("Peer {} closed the connection", self.peer_addr);
            self.closed = true;
        } else {
            trace!("Received {} bytes from {}", n, self.peer_addr);
            self.inbound.write(&chunk[..n]);
        }
        Ok(n)
    }

    /// Read exactly `n` bytes from the transport, bypassing the inbound
    /// buffer. Used for the fixed-length handshake before framed traffic
    /// begins.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await.map_err(|e| {
            self.closed = true;
            TorrentError::network_error_full("Read failed", self.peer_addr.to_string(), e.to_string())
        })?;
        Ok(buf)
    }

    /// Access the inbound buffer for frame extraction
    pub fn inbound(&mut self) -> &mut ByteBuffer {
        &mut self.inbound
    }

    /// Whether the transport is still open
    pub fn is_connected(&self) -> bool {
        !self.closed
    }

    /// Whether the peer has closed its side of the connection
    pub fn is_closing(&self) -> bool {
        self.closed
    }

    /// Shut down the write side and mark the socket closed
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("Shutdown of {} failed: {}", self.peer_addr, e);
        }
        self.closed = true;
    }
}
