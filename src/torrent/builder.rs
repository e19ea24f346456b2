//! Metainfo authoring
//!
//! Builds a .torrent document from local content using the same hashing
//! and bencoding primitives as the download path. Keys are emitted in
//! sorted order, the canonical form for freshly generated documents.

use std::path::Path;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, info};

use crate::bencode::{encode, Dictionary, Value};
use crate::digest::{Sha1Digest, DIGEST_LEN};
use crate::error::TorrentError;

/// Builder for single-file torrent descriptions
pub struct MetainfoBuilder {
    announce: String,
    piece_length: u64,
}

impl MetainfoBuilder {
    /// Create a builder for the given tracker and piece size
    pub fn new(announce: impl Into<String>, piece_length: u64) -> Result<Self> {
        if piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("Piece length cannot be zero", "piece length").into());
        }
        Ok(Self {
            announce: announce.into(),
            piece_length,
        })
    }

    /// Produce a bencoded torrent document for in-memory content
    pub fn build_from_bytes(&self, name: &str, content: &[u8]) -> Result<Bytes> {
        if name.is_empty() {
            return Err(TorrentError::validation_error_with_field("Name cannot be empty", "name").into());
        }

        debug!("Hashing {} bytes into {}-byte pieces", content.len(), self.piece_length);
        let mut piece_blob = Vec::with_capacity(content.len().div_ceil(self.piece_length as usize) * DIGEST_LEN);
        for piece in content.chunks(self.piece_length as usize) {
            piece_blob.extend_from_slice(Sha1Digest::of(piece).as_bytes());
        }

        // info keys in sorted order: length, name, piece length, pieces
        let mut info = Dictionary::new();
        info.insert(Bytes::from_static(b"length"), Value::Integer(content.len() as i64));
        info.insert(Bytes::from_static(b"name"), Value::string(name));
        info.insert(Bytes::from_static(b"piece length"), Value::Integer(self.piece_length as i64));
        info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(piece_blob)));

        let mut root = Dictionary::new();
        root.insert(Bytes::from_static(b"announce"), Value::string(&self.announce));
        root.insert(Bytes::from_static(b"info"), Value::Dict(info));

        info!("Generated metainfo for '{}' ({} bytes of content)", name, content.len());
        Ok(encode(&Value::Dict(root)))
    }

    /// Produce a bencoded torrent document for a file on disk
    pub fn build_from_file(&self, path: &Path) -> Result<Bytes> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TorrentError::validation_error_with_field("Path has no usable file name", "path"))?
            .to_string();
        let content = std::fs::read(path).map_err(|e| {
            TorrentError::storage_error_full("Failed to read source file", path.display().to_string(), e.to_string())
        })?;
        self.build_from_bytes(&name, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::parser::MetainfoParser;

    #[test]
    fn test_built_document_reparses() {
        let builder = MetainfoBuilder::new("http://tracker.example/announce", 4).unwrap();
        let doc = builder.build_from_bytes("data.bin", b"0123456789").unwrap();

        let meta = MetainfoParser::parse_bytes(&doc).unwrap();
        assert_eq!(meta.name, "data.bin");
        assert_eq!(meta.piece_length, 4);
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.total_length, 10);
        assert!(meta.is_single_file());
    }

    #[test]
    fn test_piece_hashes_match_content() {
        let builder = MetainfoBuilder::new("http://tracker.example/announce", 4).unwrap();
        let doc = builder.build_from_bytes("data.bin", b"0123456789").unwrap();
        let meta = MetainfoParser::parse_bytes(&doc).unwrap();

        assert_eq!(meta.piece_hash(0), Some(Sha1Digest::of(b"0123")));
        assert_eq!(meta.piece_hash(1), Some(Sha1Digest::of(b"4567")));
        assert_eq!(meta.piece_hash(2), Some(Sha1Digest::of(b"89")));
    }

    #[test]
    fn test_empty_content_has_no_pieces() {
        let builder = MetainfoBuilder::new("http://tracker.example/announce", 16384).unwrap();
        let doc = builder.build_from_bytes("empty.bin", b"").unwrap();
        let meta = MetainfoParser::parse_bytes(&doc).unwrap();
        assert_eq!(meta.piece_count(), 0);
        assert_eq!(meta.total_length, 0);
    }

    #[test]
    fn test_rejects_zero_piece_length() {
        assert!(MetainfoBuilder::new("http://tracker.example/announce", 0).is_err());
    }
}
