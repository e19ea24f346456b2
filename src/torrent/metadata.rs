//! Immutable torrent metadata
//!
//! The parsed view of a torrent description: info-hash, piece geometry,
//! file layout, and announce URL. Created once at load time and never
//! mutated.

use anyhow::Result;

use crate::digest::Sha1Digest;
use crate::error::TorrentError;

/// A file entry within a torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path components relative to the torrent root
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// Parsed torrent description
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// Tracker announce URL
    pub announce: String,
    /// Torrent name (single-file name or directory name)
    pub name: String,
    /// Digest of the bencoded info dictionary
    pub info_hash: Sha1Digest,
    /// Bytes per piece (the last piece may be shorter)
    pub piece_length: u64,
    /// Expected digest of each piece, in piece order
    pub piece_hashes: Vec<Sha1Digest>,
    /// File layout; a single entry for single-file torrents
    pub files: Vec<FileInfo>,
    /// Total content length across all files
    pub total_length: u64,
    single_file: bool,
}

impl TorrentMetadata {
    /// Assemble metadata, checking the structural invariants.
    ///
    /// Fails if the piece length is zero, the file list is empty, or the
    /// number of piece hashes does not match the content length.
    pub fn new(
        announce: String,
        name: String,
        info_hash: Sha1Digest,
        piece_length: u64,
        piece_hashes: Vec<Sha1Digest>,
        files: Vec<FileInfo>,
        single_file: bool,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("Piece length cannot be zero", "piece length").into());
        }
        if files.is_empty() {
            return Err(TorrentError::validation_error_with_field("Torrent has no files", "files").into());
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(TorrentError::validation_error_with_field(
                format!(
                    "Piece hash count {} does not match content length (expected {})",
                    piece_hashes.len(),
                    expected_pieces
                ),
                "pieces",
            )
            .into());
        }

        Ok(Self {
            announce,
            name,
            info_hash,
            piece_length,
            piece_hashes,
            files,
            total_length,
            single_file,
        })
    }

    /// Number of pieces in the torrent
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of the piece at `index`.
    ///
    /// Every piece is `piece_length` bytes except the last, which holds
    /// the remainder of the content.
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 == self.piece_count() {
            let tail = self.total_length % self.piece_length;
            if tail == 0 {
                self.piece_length
            } else {
                tail
            }
        } else {
            self.piece_length
        }
    }

    /// Expected digest of the piece at `index`
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Digest> {
        self.piece_hashes.get(index).copied()
    }

    /// Whether the torrent describes a single file
    pub fn is_single_file(&self) -> bool {
        self.single_file
    }
}
