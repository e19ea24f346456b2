//! SHA-1 content digests
//!
//! Pieces and torrents are identified by 160-bit SHA-1 digests. The
//! `Sha1Digest` newtype is ordered and hashable so digests can key maps
//! (info-hash lookup, piece-hash indexing).

use std::fmt;

use sha1::{Digest, Sha1};

/// Number of bytes in a SHA-1 digest
pub const DIGEST_LEN: usize = 20;

/// A 160-bit SHA-1 digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1Digest([u8; DIGEST_LEN]);

impl Sha1Digest {
    /// Wrap a raw 20-byte digest
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a digest from a byte slice, failing if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Digest a complete byte sequence in one call
    pub fn of(data: &[u8]) -> Self {
        let mut builder = DigestBuilder::new();
        builder.update(data);
        builder.finish()
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Hex rendering of the digest
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.to_hex())
    }
}

/// Streaming SHA-1 accumulator.
///
/// Accepts repeated appends before finalization, so large inputs (piece
/// assembly, whole-file hashing) never need a contiguous copy.
#[derive(Default)]
pub struct DigestBuilder {
    hasher: Sha1,
}

impl DigestBuilder {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    /// Append bytes to the running digest
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and return the digest
    pub fn finish(self) -> Sha1Digest {
        let output = self.hasher.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&output);
        Sha1Digest(bytes)
    }
}
