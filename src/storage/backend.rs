//! Storage backend abstraction
//!
//! The piece engine hands verified pieces to a backend and reads them
//! back when serving uploads. Backend failures are fatal to the torrent;
//! callers must not swallow them.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Destination for verified piece data
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare the backing store (directories, pre-allocated files)
    async fn initialize(&mut self) -> Result<()>;

    /// Persist a verified piece. Only called with data whose digest
    /// already matched the expected piece hash.
    async fn write_piece(&mut self, piece_index: u32, data: Bytes) -> Result<()>;

    /// Read a previously written piece back in full
    async fn read_piece(&self, piece_index: u32) -> Result<Bytes>;

    /// Flush any buffered writes to durable storage
    async fn flush(&mut self) -> Result<()>;
}
