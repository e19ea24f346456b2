//! Piece bitfield
//!
//! One bit per piece, most-significant bit first within each byte, the
//! layout used by the `bitfield` wire message.

use anyhow::Result;

use crate::error::TorrentError;

/// A bit vector with one bit per piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Create an all-zero bitfield for `num_pieces` pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Build a bitfield from wire bytes.
    ///
    /// The byte length must match the piece count exactly; spare bits in
    /// the final byte are cleared rather than rejected.
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self> {
        let expected = num_pieces.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield length mismatch",
                format!("{} bytes for {} pieces (expected {})", bytes.len(), num_pieces, expected),
            )
            .into());
        }
        let mut field = Self {
            bits: bytes.to_vec(),
            num_pieces,
        };
        field.clear_spare_bits();
        Ok(field)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.num_pieces;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= !((1u8 << spare) - 1);
            }
        }
    }

    /// Whether the piece at `index` is set
    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bits[index / 8] & (1 << (7 - index % 8)) != 0
    }

    /// Set the bit for the piece at `index`
    pub fn set(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether every piece bit is set
    pub fn is_all_set(&self) -> bool {
        self.count_set() == self.num_pieces
    }

    /// Number of pieces the bitfield covers
    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Wire representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let field = Bitfield::new(10);
        assert_eq!(field.count_set(), 0);
        assert!(!field.has(0));
        assert_eq!(field.as_bytes().len(), 2);
    }

    #[test]
    fn test_set_and_has_msb_first() {
        let mut field = Bitfield::new(10);
        field.set(0);
        field.set(9);
        assert!(field.has(0));
        assert!(field.has(9));
        assert!(!field.has(1));
        assert_eq!(field.as_bytes(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn test_out_of_range_index_is_ignored() {
        let mut field = Bitfield::new(10);
        field.set(10);
        assert!(!field.has(10));
        assert_eq!(field.count_set(), 0);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(Bitfield::from_bytes(&[0u8; 2], 10).is_ok());
        assert!(Bitfield::from_bytes(&[0u8; 1], 10).is_err());
        assert!(Bitfield::from_bytes(&[0u8; 3], 10).is_err());
    }

    #[test]
    fn test_from_bytes_clears_spare_bits() {
        // low 6 bits of the second byte are past the end for 10 pieces
        let field = Bitfield::from_bytes(&[0xff, 0xff], 10).unwrap();
        assert_eq!(field.count_set(), 10);
        assert!(field.is_all_set());
    }

    #[test]
    fn test_exact_multiple_of_eight() {
        let mut field = Bitfield::new(8);
        for i in 0..8 {
            field.set(i);
        }
        assert!(field.is_all_set());
        assert_eq!(field.as_bytes(), &[0xff]);
    }
}
