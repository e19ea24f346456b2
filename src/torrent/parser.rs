//! Metainfo parser
//!
//! Decodes a bencoded torrent description and converts it into
//! `TorrentMetadata`. The info-hash is computed by re-encoding the info
//! dictionary with its keys in the order captured at decode time, which
//! reproduces the document's original bytes.

use std::path::Path;

use anyhow::Result;
use bytes::BytesMut;
use tracing::{debug, error, info};
use url::Url;

use crate::bencode::{self, Dictionary, Value};
use crate::digest::{Sha1Digest, DIGEST_LEN};
use crate::error::TorrentError;
use crate::torrent::metadata::{FileInfo, TorrentMetadata};

/// Parser for .torrent documents
pub struct MetainfoParser;

impl MetainfoParser {
    /// Parse a torrent description from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMetadata> {
        info!("Parsing metainfo from {} bytes", data.len());

        let root = bencode::decode(data)
            .map_err(|e| TorrentError::parse_error_with_source("Invalid metainfo document", e.to_string()))?;
        let root = root
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("Metainfo root is not a dictionary"))?;

        let announce = required_str(root, b"announce")?.to_string();
        Url::parse(&announce)
            .map_err(|e| TorrentError::parse_error_with_source("Invalid announce URL", e.to_string()))?;

        let info = root
            .get(b"info")
            .ok_or_else(|| TorrentError::parse_error("Missing key: info"))?
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("Key 'info' is not a dictionary"))?;

        let info_hash = Self::info_hash(info);
        debug!("Computed info-hash {}", info_hash);

        let name = required_str(info, b"name")?.to_string();

        let piece_length = required_integer(info, b"piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::parse_error("Piece length must be positive").into());
        }

        let pieces = info
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| TorrentError::parse_error("Missing key: pieces"))?;
        if pieces.len() % DIGEST_LEN != 0 {
            error!("Piece hash blob length {} is not a multiple of {}", pieces.len(), DIGEST_LEN);
            return Err(TorrentError::parse_error_with_source(
                "Piece hash blob has invalid length",
                format!("{} bytes", pieces.len()),
            )
            .into());
        }
        let piece_hashes: Vec<Sha1Digest> = pieces
            .chunks_exact(DIGEST_LEN)
            .map(|chunk| Sha1Digest::from_slice(chunk).expect("chunk is exactly 20 bytes"))
            .collect();

        let (files, single_file) = Self::parse_files(info, &name)?;

        let metadata = TorrentMetadata::new(announce, name, info_hash, piece_length as u64, piece_hashes, files, single_file)?;
        info!(
            "Parsed torrent '{}': {} pieces of {} bytes, {} bytes total",
            metadata.name,
            metadata.piece_count(),
            metadata.piece_length,
            metadata.total_length
        );
        Ok(metadata)
    }

    /// Parse a torrent description from a file on disk
    pub fn parse_file(path: &Path) -> Result<TorrentMetadata> {
        info!("Loading torrent file from {}", path.display());
        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;
        Self::parse_bytes(&data)
    }

    /// Digest of the canonically re-encoded info dictionary
    fn info_hash(info: &Dictionary) -> Sha1Digest {
        let mut buf = BytesMut::new();
        bencode::encode_into(&Value::Dict(info.clone()), &mut buf);
        Sha1Digest::of(&buf)
    }

    fn parse_files(info: &Dictionary, name: &str) -> Result<(Vec<FileInfo>, bool)> {
        match (info.get(b"length"), info.get(b"files")) {
            (Some(length), None) => {
                let length = length
                    .as_integer()
                    .filter(|&l| l >= 0)
                    .ok_or_else(|| TorrentError::parse_error("Key 'length' is not a valid integer"))?;
                Ok((
                    vec![FileInfo {
                        path: vec![name.to_string()],
                        length: length as u64,
                    }],
                    true,
                ))
            }
            (None, Some(files)) => {
                let entries = files
                    .as_list()
                    .ok_or_else(|| TorrentError::parse_error("Key 'files' is not a list"))?;
                if entries.is_empty() {
                    return Err(TorrentError::parse_error("File list is empty").into());
                }
                let mut out = Vec::with_capacity(entries.len());
                for entry in entries {
                    let entry = entry
                        .as_dict()
                        .ok_or_else(|| TorrentError::parse_error("File entry is not a dictionary"))?;
                    let length = required_integer(entry, b"length")?;
                    if length < 0 {
                        return Err(TorrentError::parse_error("File length is negative").into());
                    }
                    let path_list = entry
                        .get(b"path")
                        .and_then(|v| v.as_list())
                        .ok_or_else(|| TorrentError::parse_error("File entry missing path list"))?;
                    let mut path = Vec::with_capacity(path_list.len());
                    for component in path_list {
                        let component = component
                            .as_str()
                            .ok_or_else(|| TorrentError::parse_error("File path component is not a string"))?;
                        if component.is_empty() || component == "." || component == ".." {
                            return Err(TorrentError::parse_error_with_source(
                                "Unsafe file path component",
                                component.to_string(),
                            )
                            .into());
                        }
                        path.push(component.to_string());
                    }
                    if path.is_empty() {
                        return Err(TorrentError::parse_error("File path list is empty").into());
                    }
                    out.push(FileInfo {
                        path,
                        length: length as u64,
                    });
                }
                Ok((out, false))
            }
            (Some(_), Some(_)) => Err(TorrentError::parse_error("Both 'length' and 'files' are present").into()),
            (None, None) => Err(TorrentError::parse_error("Neither 'length' nor 'files' is present").into()),
        }
    }
}

fn required_str<'a>(dict: &'a Dictionary, key: &[u8]) -> Result<&'a str> {
    dict.get(key)
        .ok_or_else(|| TorrentError::parse_error(format!("Missing key: {}", String::from_utf8_lossy(key))))?
        .as_str()
        .ok_or_else(|| {
            TorrentError::parse_error(format!("Key '{}' is not a UTF-8 string", String::from_utf8_lossy(key))).into()
        })
}

fn required_integer(dict: &Dictionary, key: &[u8]) -> Result<i64> {
    dict.get(key)
        .ok_or_else(|| TorrentError::parse_error(format!("Missing key: {}", String::from_utf8_lossy(key))))?
        .as_integer()
        .ok_or_else(|| {
            TorrentError::parse_error(format!("Key '{}' is not an integer", String::from_utf8_lossy(key))).into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        doc.extend_from_slice(b"6:lengthi512e4:name8:data.bin12:piece lengthi256e6:pieces40:");
        doc.extend_from_slice(&[0x11u8; 20]);
        doc.extend_from_slice(&[0x22u8; 20]);
        doc.extend_from_slice(b"ee");
        doc
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let meta = MetainfoParser::parse_bytes(&single_file_torrent()).unwrap();
        assert_eq!(meta.announce, "http://tracker.example/announce");
        assert_eq!(meta.name, "data.bin");
        assert_eq!(meta.piece_length, 256);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.total_length, 512);
        assert!(meta.is_single_file());
        assert_eq!(meta.piece_hash(0), Some(Sha1Digest::from_bytes([0x11; 20])));
    }

    #[test]
    fn test_info_hash_matches_original_bytes() {
        let doc = single_file_torrent();
        let meta = MetainfoParser::parse_bytes(&doc).unwrap();

        // digest of the raw info substring of the document
        let start = doc.windows(5).position(|w| w == b"4:inf").unwrap() + "4:info".len();
        let end = doc.len() - 1; // trailing 'e' closes the root dict
        let expected = Sha1Digest::of(&doc[start..end]);
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn test_info_hash_preserves_unsorted_key_order() {
        // info keys deliberately not in sorted order; the digest must cover
        // the bytes as they appear, not a re-sorted form
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        doc.extend_from_slice(b"4:name8:data.bin6:lengthi256e12:piece lengthi256e6:pieces20:");
        doc.extend_from_slice(&[0x33u8; 20]);
        doc.extend_from_slice(b"ee");

        let meta = MetainfoParser::parse_bytes(&doc).unwrap();
        let start = doc.windows(5).position(|w| w == b"4:inf").unwrap() + "4:info".len();
        let end = doc.len() - 1;
        assert_eq!(meta.info_hash, Sha1Digest::of(&doc[start..end]));
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        doc.extend_from_slice(b"5:filesld6:lengthi300e4:pathl5:inner5:a.bineed6:lengthi212e4:pathl5:b.bineee");
        doc.extend_from_slice(b"4:name4:pack12:piece lengthi256e6:pieces40:");
        doc.extend_from_slice(&[0x44u8; 20]);
        doc.extend_from_slice(&[0x55u8; 20]);
        doc.extend_from_slice(b"ee");

        let meta = MetainfoParser::parse_bytes(&doc).unwrap();
        assert!(!meta.is_single_file());
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].path, vec!["inner".to_string(), "a.bin".to_string()]);
        assert_eq!(meta.total_length, 512);
    }

    #[test]
    fn test_rejects_missing_announce() {
        let doc = b"d4:infod6:lengthi0e4:name1:x12:piece lengthi256e6:pieces0:ee";
        assert!(MetainfoParser::parse_bytes(doc).is_err());
    }

    #[test]
    fn test_rejects_bad_pieces_length() {
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        doc.extend_from_slice(b"6:lengthi512e4:name8:data.bin12:piece lengthi256e6:pieces19:");
        doc.extend_from_slice(&[0u8; 19]);
        doc.extend_from_slice(b"ee");
        assert!(MetainfoParser::parse_bytes(&doc).is_err());
    }

    #[test]
    fn test_rejects_inconsistent_length() {
        // 512 bytes of content but only one piece hash
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        doc.extend_from_slice(b"6:lengthi512e4:name8:data.bin12:piece lengthi256e6:pieces20:");
        doc.extend_from_slice(&[0u8; 20]);
        doc.extend_from_slice(b"ee");
        assert!(MetainfoParser::parse_bytes(&doc).is_err());
    }

    #[test]
    fn test_rejects_unsafe_path_component() {
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        doc.extend_from_slice(b"5:filesld6:lengthi256e4:pathl2:..5:a.bineee");
        doc.extend_from_slice(b"4:name4:pack12:piece lengthi256e6:pieces20:");
        doc.extend_from_slice(&[0u8; 20]);
        doc.extend_from_slice(b"ee");
        assert!(MetainfoParser::parse_bytes(&doc).is_err());
    }

    #[test]
    fn test_rejects_non_dict_root() {
        assert!(MetainfoParser::parse_bytes(b"i42e").is_err());
        assert!(MetainfoParser::parse_bytes(b"garbage").is_err());
    }
}
