//! On-disk storage backend
//!
//! Pre-allocates the torrent's file layout under the download directory
//! and maps each piece's absolute byte span onto the files it overlaps,
//! so a piece that straddles a file boundary is split across positional
//! writes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;
use crate::torrent::TorrentMetadata;

/// A file's position within the torrent's contiguous byte space
#[derive(Debug, Clone)]
struct FileSpan {
    path: PathBuf,
    /// Absolute offset of the file's first byte
    start: u64,
    length: u64,
}

/// Disk-backed piece storage
pub struct FileStorage {
    metadata: Arc<TorrentMetadata>,
    spans: Vec<FileSpan>,
}

impl FileStorage {
    /// Lay out the torrent's files under `base_path`.
    ///
    /// Single-file torrents go directly under the base directory;
    /// multi-file torrents nest under a directory named after the
    /// torrent.
    pub fn new(base_path: PathBuf, metadata: Arc<TorrentMetadata>) -> Self {
        let root = if metadata.is_single_file() {
            base_path
        } else {
            base_path.join(&metadata.name)
        };

        let mut spans = Vec::with_capacity(metadata.files.len());
        let mut offset = 0u64;
        for file in &metadata.files {
            let mut path = root.clone();
            for component in &file.path {
                path.push(component);
            }
            spans.push(FileSpan {
                path,
                start: offset,
                length: file.length,
            });
            offset += file.length;
        }

        Self { metadata, spans }
    }

    /// Spans overlapping the byte range `[offset, offset + len)`
    fn spans_for(&self, offset: u64, len: u64) -> impl Iterator<Item = &FileSpan> {
        let end = offset + len;
        self.spans
            .iter()
            .filter(move |s| s.start < end && s.start + s.length > offset)
    }

    fn piece_span(&self, piece_index: u32) -> Result<(u64, u64)> {
        let index = piece_index as usize;
        if index >= self.metadata.piece_count() {
            return Err(TorrentError::storage_error(format!("Piece index {} out of range", piece_index)).into());
        }
        let offset = piece_index as u64 * self.metadata.piece_length;
        Ok((offset, self.metadata.piece_size(index)))
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn initialize(&mut self) -> Result<()> {
        info!("Pre-allocating {} file(s) for '{}'", self.spans.len(), self.metadata.name);
        for span in &self.spans {
            if let Some(parent) = span.path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&span.path)
                .await
                .map_err(|e| {
                    TorrentError::storage_error_full("Failed to create file", span.path.display().to_string(), e.to_string())
                })?;
            file.set_len(span.length).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to size file", span.path.display().to_string(), e.to_string())
            })?;
            debug!("Allocated {} ({} bytes)", span.path.display(), span.length);
        }
        Ok(())
    }

    async fn write_piece(&mut self, piece_index: u32, data: Bytes) -> Result<()> {
        let (piece_offset, piece_len) = self.piece_span(piece_index)?;
        if data.len() as u64 != piece_len {
            return Err(TorrentError::storage_error(format!(
                "Piece {} has {} bytes, expected {}",
                piece_index,
                data.len(),
                piece_len
            ))
            .into());
        }

        trace!("Writing piece {} ({} bytes at offset {})", piece_index, piece_len, piece_offset);
        for span in self.spans_for(piece_offset, piece_len) {
            let span_begin = piece_offset.max(span.start);
            let span_end = (piece_offset + piece_len).min(span.start + span.length);
            let data_begin = (span_begin - piece_offset) as usize;
            let data_end = (span_end - piece_offset) as usize;

            let mut file = fs::OpenOptions::new().write(true).open(&span.path).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to open file", span.path.display().to_string(), e.to_string())
            })?;
            file.seek(SeekFrom::Start(span_begin - span.start)).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to seek", span.path.display().to_string(), e.to_string())
            })?;
            file.write_all(&data[data_begin..data_end]).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to write piece", span.path.display().to_string(), e.to_string())
            })?;
            file.flush().await.map_err(|e| {
                TorrentError::storage_error_full("Failed to flush", span.path.display().to_string(), e.to_string())
            })?;
        }
        Ok(())
    }

    async fn read_piece(&self, piece_index: u32) -> Result<Bytes> {
        let (piece_offset, piece_len) = self.piece_span(piece_index)?;
        let mut out = vec![0u8; piece_len as usize];

        for span in self.spans_for(piece_offset, piece_len) {
            let span_begin = piece_offset.max(span.start);
            let span_end = (piece_offset + piece_len).min(span.start + span.length);
            let out_begin = (span_begin - piece_offset) as usize;
            let out_end = (span_end - piece_offset) as usize;

            let mut file = fs::File::open(&span.path).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to open file", span.path.display().to_string(), e.to_string())
            })?;
            file.seek(SeekFrom::Start(span_begin - span.start)).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to seek", span.path.display().to_string(), e.to_string())
            })?;
            file.read_exact(&mut out[out_begin..out_end]).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to read piece", span.path.display().to_string(), e.to_string())
            })?;
        }
        Ok(Bytes::from(out))
    }

    async fn flush(&mut self) -> Result<()> {
        for span in &self.spans {
            let file = fs::OpenOptions::new().write(true).open(&span.path).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to open file", span.path.display().to_string(), e.to_string())
            })?;
            file.sync_data().await.map_err(|e| {
                TorrentError::storage_error_full("Failed to sync file", span.path.display().to_string(), e.to_string())
            })?;
        }
        debug!("Flushed {} file(s)", self.spans.len());
        Ok(())
    }
}
