//! Per-piece download state
//!
//! A `PieceRecord` tracks the blocks of one piece: which are missing,
//! requested, or received, which peers hold outstanding requests, and
//! the assembly buffer the received bytes land in. Block boundaries
//! never cross piece boundaries.

use std::net::SocketAddr;

use anyhow::Result;

use crate::digest::Sha1Digest;
use crate::error::TorrentError;

/// Bytes per block, the unit requested over the wire
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// State of a single block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Missing,
    Requested,
    Received,
}

/// Overall state of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InProgress,
    Verifying,
    Complete,
}

/// A block identified by piece index, byte offset, and length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Result of storing one received block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    /// Block accepted; the piece still has unreceived blocks
    Stored,
    /// Block accepted and the piece is now fully assembled
    PieceFilled,
    /// The block was already received; bytes discarded
    Duplicate,
}

/// Download state for one piece
#[derive(Debug)]
pub struct PieceRecord {
    pub index: u32,
    length: u32,
    expected: Sha1Digest,
    pub state: PieceState,
    blocks: Vec<BlockState>,
    /// Peers with an outstanding request per block; more than one entry
    /// only during endgame
    assigned: Vec<Vec<SocketAddr>>,
    buffer: Vec<u8>,
    received: usize,
}

impl PieceRecord {
    /// Create a record for a piece of `length` bytes
    pub fn new(index: u32, length: u32, expected: Sha1Digest) -> Self {
        let block_count = length.div_ceil(BLOCK_LENGTH) as usize;
        Self {
            index,
            length,
            expected,
            state: PieceState::Missing,
            blocks: vec![BlockState::Missing; block_count],
            assigned: vec![Vec::new(); block_count],
            buffer: Vec::new(),
            received: 0,
        }
    }

    /// Number of blocks in the piece
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks not yet received
    pub fn blocks_unreceived(&self) -> usize {
        self.blocks.len() - self.received
    }

    /// Piece length in bytes
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Expected digest for the assembled piece
    pub fn expected_digest(&self) -> Sha1Digest {
        self.expected
    }

    /// Byte length of the block at `block_index` (the last may be short)
    pub fn block_length(&self, block_index: usize) -> u32 {
        let start = block_index as u32 * BLOCK_LENGTH;
        BLOCK_LENGTH.min(self.length - start)
    }

    /// Wire request for the block at `block_index`
    pub fn request_for(&self, block_index: usize) -> BlockRequest {
        BlockRequest {
            piece: self.index,
            offset: block_index as u32 * BLOCK_LENGTH,
            length: self.block_length(block_index),
        }
    }

    /// State of the block at `block_index`
    pub fn block_state(&self, block_index: usize) -> BlockState {
        self.blocks[block_index]
    }

    /// Lowest-offset block `peer` may claim.
    ///
    /// Outside endgame only Missing blocks qualify. During endgame a
    /// Requested block may be claimed again, as long as this peer does
    /// not already hold a request for it.
    pub fn claimable_block(&self, peer: SocketAddr, endgame: bool) -> Option<usize> {
        self.blocks.iter().enumerate().position(|(i, &state)| match state {
            BlockState::Missing => true,
            BlockState::Requested => endgame && !self.assigned[i].contains(&peer),
            BlockState::Received => false,
        })
    }

    /// Record an outstanding request from `peer` for the block
    pub fn mark_requested(&mut self, block_index: usize, peer: SocketAddr) {
        self.blocks[block_index] = BlockState::Requested;
        if !self.assigned[block_index].contains(&peer) {
            self.assigned[block_index].push(peer);
        }
        if self.state == PieceState::Missing {
            self.state = PieceState::InProgress;
        }
    }

    /// Release `peer`'s claim on the block, reverting it to Missing when
    /// no other peer still has it requested
    pub fn release_block(&mut self, block_index: usize, peer: SocketAddr) {
        let assignees = &mut self.assigned[block_index];
        assignees.retain(|p| *p != peer);
        if assignees.is_empty() && self.blocks[block_index] == BlockState::Requested {
            self.blocks[block_index] = BlockState::Missing;
        }
    }

    /// Release every claim held by `peer` on this piece
    pub fn release_peer(&mut self, peer: SocketAddr) {
        for block_index in 0..self.blocks.len() {
            self.release_block(block_index, peer);
        }
    }

    /// Store a received block.
    ///
    /// The offset must be block-aligned and the data length must match
    /// the block's expected length; anything else is a protocol
    /// violation on the sending peer.
    pub fn store_block(&mut self, offset: u32, data: &[u8]) -> Result<StoreResult> {
        if offset % BLOCK_LENGTH != 0 || offset >= self.length {
            return Err(TorrentError::protocol_error_with_source(
                "Block offset out of range",
                format!("piece {}, offset {}", self.index, offset),
            )
            .into());
        }
        let block_index = (offset / BLOCK_LENGTH) as usize;
        let expected_len = self.block_length(block_index);
        if data.len() as u32 != expected_len {
            return Err(TorrentError::protocol_error_with_source(
                "Block length mismatch",
                format!("piece {}, offset {}: {} bytes, expected {}", self.index, offset, data.len(), expected_len),
            )
            .into());
        }

        if self.blocks[block_index] == BlockState::Received {
            return Ok(StoreResult::Duplicate);
        }

        if self.buffer.is_empty() {
            self.buffer = vec![0u8; self.length as usize];
        }
        self.buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        self.blocks[block_index] = BlockState::Received;
        self.assigned[block_index].clear();
        self.received += 1;

        if self.received == self.blocks.len() {
            Ok(StoreResult::PieceFilled)
        } else {
            Ok(StoreResult::Stored)
        }
    }

    /// The assembled piece bytes; meaningful only after `PieceFilled`
    pub fn assembled(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the assembly buffer after successful verification
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Discard all progress: blocks revert to Missing, the buffer is
    /// dropped, outstanding claims are cleared. Partial data from a
    /// failed piece is never retained.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            *block = BlockState::Missing;
        }
        for assignees in &mut self.assigned {
            assignees.clear();
        }
        self.buffer = Vec::new();
        self.received = 0;
        self.state = PieceState::Missing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_block_geometry() {
        let record = PieceRecord::new(0, 40_000, Sha1Digest::from_bytes([0u8; 20]));
        assert_eq!(record.block_count(), 3);
        assert_eq!(record.block_length(0), BLOCK_LENGTH);
        assert_eq!(record.block_length(2), 40_000 - 2 * BLOCK_LENGTH);
        assert_eq!(
            record.request_for(2),
            BlockRequest {
                piece: 0,
                offset: 2 * BLOCK_LENGTH,
                length: 40_000 - 2 * BLOCK_LENGTH,
            }
        );
    }

    #[test]
    fn test_claim_and_release() {
        let mut record = PieceRecord::new(0, 2 * BLOCK_LENGTH, Sha1Digest::from_bytes([0u8; 20]));
        let a = peer(1000);
        let b = peer(1001);

        assert_eq!(record.claimable_block(a, false), Some(0));
        record.mark_requested(0, a);
        assert_eq!(record.state, PieceState::InProgress);

        // outside endgame the requested block is not claimable by b
        assert_eq!(record.claimable_block(b, false), Some(1));
        record.mark_requested(1, b);
        assert_eq!(record.claimable_block(b, false), None);

        // releasing a's claim reverts block 0 to Missing
        record.release_peer(a);
        assert_eq!(record.block_state(0), BlockState::Missing);
        assert_eq!(record.claimable_block(b, false), Some(0));
    }

    #[test]
    fn test_endgame_allows_second_claim() {
        let mut record = PieceRecord::new(0, BLOCK_LENGTH, Sha1Digest::from_bytes([0u8; 20]));
        let a = peer(1000);
        let b = peer(1001);

        record.mark_requested(0, a);
        assert_eq!(record.claimable_block(b, false), None);
        assert_eq!(record.claimable_block(b, true), Some(0));
        record.mark_requested(0, b);
        // the same peer cannot claim its own outstanding block again
        assert_eq!(record.claimable_block(b, true), None);

        // releasing one of two claims keeps the block Requested
        record.release_block(0, a);
        assert_eq!(record.block_state(0), BlockState::Requested);
        record.release_block(0, b);
        assert_eq!(record.block_state(0), BlockState::Missing);
    }

    #[test]
    fn test_store_block_fills_piece() {
        let length = BLOCK_LENGTH + 100;
        let mut record = PieceRecord::new(3, length, Sha1Digest::from_bytes([0u8; 20]));

        let first = vec![0xaau8; BLOCK_LENGTH as usize];
        assert_eq!(record.store_block(0, &first).unwrap(), StoreResult::Stored);

        let second = vec![0xbbu8; 100];
        assert_eq!(record.store_block(BLOCK_LENGTH, &second).unwrap(), StoreResult::PieceFilled);

        assert_eq!(record.assembled().len(), length as usize);
        assert_eq!(record.assembled()[0], 0xaa);
        assert_eq!(record.assembled()[BLOCK_LENGTH as usize], 0xbb);
    }

    #[test]
    fn test_duplicate_block_is_discarded() {
        let mut record = PieceRecord::new(0, BLOCK_LENGTH, Sha1Digest::from_bytes([0u8; 20]));
        let data = vec![1u8; BLOCK_LENGTH as usize];
        assert_eq!(record.store_block(0, &data).unwrap(), StoreResult::PieceFilled);
        assert_eq!(record.store_block(0, &data).unwrap(), StoreResult::Duplicate);
    }

    #[test]
    fn test_store_block_rejects_bad_geometry() {
        let mut record = PieceRecord::new(0, 2 * BLOCK_LENGTH, Sha1Digest::from_bytes([0u8; 20]));
        // unaligned offset
        assert!(record.store_block(7, &[0u8; 10]).is_err());
        // offset past the piece
        assert!(record.store_block(4 * BLOCK_LENGTH, &[0u8; 10]).is_err());
        // wrong length
        assert!(record.store_block(0, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut record = PieceRecord::new(0, 2 * BLOCK_LENGTH, Sha1Digest::from_bytes([0u8; 20]));
        let a = peer(1000);
        record.mark_requested(1, a);
        record.store_block(0, &vec![1u8; BLOCK_LENGTH as usize]).unwrap();

        record.reset();
        assert_eq!(record.state, PieceState::Missing);
        assert_eq!(record.blocks_unreceived(), 2);
        assert_eq!(record.block_state(0), BlockState::Missing);
        assert_eq!(record.block_state(1), BlockState::Missing);
        assert!(record.assembled().is_empty());
        assert_eq!(record.claimable_block(a, false), Some(0));
    }
}
