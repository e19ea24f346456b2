//! BitTorrent handshake
//!
//! The fixed 68-byte exchange that opens every peer connection: protocol
//! string, reserved bytes, info-hash, peer id. A session proceeds only
//! when the remote's info-hash matches the torrent being served.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::digest::Sha1Digest;
use crate::error::TorrentError;

/// Protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Total handshake length on the wire
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL_STRING.len();

/// Peer-id prefix identifying this client
const PEER_ID_PREFIX: &[u8; 8] = b"-SW0100-";

/// A peer handshake message
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Reserved extension bits (all zero; no extensions supported)
    pub reserved: [u8; 8],
    /// Torrent identity
    pub info_hash: Sha1Digest,
    /// Sender's peer id
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a handshake for a torrent
    pub fn new(info_hash: Sha1Digest, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a fresh peer id with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        debug!("Generated peer id {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize to the fixed wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Parse a handshake from exactly `HANDSHAKE_LEN` bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::protocol_error_with_source(
                "Handshake has wrong length",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        let pstrlen = data[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() || &data[1..1 + pstrlen] != PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::protocol_error("Unknown protocol string in handshake").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let info_hash = Sha1Digest::from_slice(&data[28..48]).expect("info-hash slice is 20 bytes");

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Whether the remote is talking about the same torrent
    pub fn matches(&self, info_hash: &Sha1Digest) -> bool {
        self.info_hash == *info_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Sha1Digest {
        Sha1Digest::from_bytes([0x42u8; 20])
    }

    #[test]
    fn test_serialize_layout() {
        let handshake = Handshake::new(digest(), [0x11u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[0x42u8; 20]);
        assert_eq!(&bytes[48..68], &[0x11u8; 20]);
    }

    #[test]
    fn test_round_trip() {
        let original = Handshake::new(digest(), [0x11u8; 20]);
        let parsed = Handshake::deserialize(&original.serialize()).unwrap();
        assert_eq!(parsed.info_hash, original.info_hash);
        assert_eq!(parsed.peer_id, original.peer_id);
    }

    #[test]
    fn test_rejects_short_input() {
        assert!(Handshake::deserialize(&[0u8; 10]).is_err());
        assert!(Handshake::deserialize(&[0u8; HANDSHAKE_LEN - 1]).is_err());
    }

    #[test]
    fn test_rejects_unknown_protocol_string() {
        let mut bytes = Handshake::new(digest(), [0u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_matches_info_hash() {
        let handshake = Handshake::new(digest(), [0u8; 20]);
        assert!(handshake.matches(&digest()));
        assert!(!handshake.matches(&Sha1Digest::from_bytes([0u8; 20])));
    }

    #[test]
    fn test_generated_peer_id_has_prefix() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], PEER_ID_PREFIX);
        // the random tails should differ between calls
        assert_ne!(Handshake::generate_peer_id()[8..], peer_id[8..]);
    }
}
