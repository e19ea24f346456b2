//! Piece manager
//!
//! Owns all per-piece download state, hands out block requests under the
//! rarest-first policy, verifies assembled pieces, and commits verified
//! data to storage. All mutating calls arrive through the engine's
//! single `Mutex`, so the manager itself needs no internal locking.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::digest::Sha1Digest;
use crate::error::TorrentError;
use crate::piece::bitfield::Bitfield;
use crate::piece::record::{BlockRequest, PieceRecord, PieceState, StoreResult, BLOCK_LENGTH};
use crate::storage::StorageBackend;
use crate::torrent::TorrentMetadata;

/// Outcome of feeding one received block to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block stored; the piece is still incomplete
    Accepted,
    /// Block already held (endgame duplicate); bytes discarded
    Duplicate,
    /// The block completed its piece and the digest matched
    Verified { piece: u32 },
    /// The block completed its piece but the digest did not match;
    /// every block of the piece is Missing again
    HashMismatch { piece: u32 },
}

/// Download state and scheduling for all pieces of one torrent
pub struct PieceManager {
    metadata: Arc<TorrentMetadata>,
    storage: Box<dyn StorageBackend>,
    records: Vec<PieceRecord>,
    /// How many connected peers advertise each piece
    availability: Vec<u32>,
    have: Bitfield,
    endgame_threshold: usize,
    blocks_unreceived: usize,
    pieces_complete: usize,
    bytes_verified: u64,
    bytes_downloaded: u64,
    bytes_uploaded: u64,
    hash_failures: u64,
}

impl PieceManager {
    /// Build the manager for a torrent, with verified pieces going to
    /// `storage`
    pub fn new(metadata: Arc<TorrentMetadata>, storage: Box<dyn StorageBackend>, endgame_threshold: usize) -> Self {
        let records: Vec<PieceRecord> = (0..metadata.piece_count())
            .map(|i| {
                PieceRecord::new(
                    i as u32,
                    metadata.piece_size(i) as u32,
                    metadata.piece_hash(i).expect("piece index in range"),
                )
            })
            .collect();
        let blocks_unreceived = records.iter().map(|r| r.block_count()).sum();
        let piece_count = records.len();

        Self {
            metadata,
            storage,
            records,
            availability: vec![0; piece_count],
            have: Bitfield::new(piece_count),
            endgame_threshold,
            blocks_unreceived,
            pieces_complete: 0,
            bytes_verified: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            hash_failures: 0,
        }
    }

    /// Prepare the storage backend
    pub async fn initialize_storage(&mut self) -> Result<()> {
        self.storage.initialize().await
    }

    /// Whether the download is in its endgame phase
    pub fn in_endgame(&self) -> bool {
        self.blocks_unreceived > 0 && self.blocks_unreceived < self.endgame_threshold
    }

    /// Choose the next block to request from a peer advertising `remote`.
    ///
    /// Rarest-first among pieces the peer has and we lack, tie-broken by
    /// lowest piece index; within the chosen piece, the lowest-offset
    /// claimable block. Returns `None` when the peer has nothing useful.
    pub fn select_work(&mut self, peer: SocketAddr, remote: &Bitfield) -> Option<BlockRequest> {
        let endgame = self.in_endgame();
        let mut best: Option<(u32, usize, usize)> = None;

        for index in 0..self.records.len() {
            if !remote.has(index) || self.have.has(index) {
                continue;
            }
            let Some(block) = self.records[index].claimable_block(peer, endgame) else {
                continue;
            };
            let avail = self.availability[index];
            if best.map_or(true, |(best_avail, _, _)| avail < best_avail) {
                best = Some((avail, index, block));
            }
        }

        let (_, index, block) = best?;
        self.records[index].mark_requested(block, peer);
        let request = self.records[index].request_for(block);
        trace!(
            "Selected piece {} block at offset {} for {} (availability {}, endgame {})",
            index,
            request.offset,
            peer,
            self.availability[index],
            endgame
        );
        Some(request)
    }

    /// Store a received block, verifying the piece when it fills.
    ///
    /// Returns a protocol error for out-of-range or misshapen blocks
    /// (the session closes), and a storage error when a verified piece
    /// cannot be persisted (fatal to the torrent).
    pub async fn on_block_received(
        &mut self,
        piece: u32,
        offset: u32,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<BlockOutcome> {
        let index = piece as usize;
        if index >= self.records.len() {
            return Err(TorrentError::protocol_error_with_source(
                "Piece index out of range",
                format!("piece {} from {}", piece, from),
            )
            .into());
        }
        if self.have.has(index) {
            // late endgame duplicate for an already-verified piece
            trace!("Discarding block for completed piece {} from {}", piece, from);
            return Ok(BlockOutcome::Duplicate);
        }

        match self.records[index].store_block(offset, data)? {
            StoreResult::Duplicate => {
                trace!("Duplicate block piece {} offset {} from {}", piece, offset, from);
                Ok(BlockOutcome::Duplicate)
            }
            StoreResult::Stored => {
                self.bytes_downloaded += data.len() as u64;
                self.blocks_unreceived -= 1;
                Ok(BlockOutcome::Accepted)
            }
            StoreResult::PieceFilled => {
                self.bytes_downloaded += data.len() as u64;
                self.blocks_unreceived -= 1;
                self.verify_piece(index).await
            }
        }
    }

    async fn verify_piece(&mut self, index: usize) -> Result<BlockOutcome> {
        let record = &mut self.records[index];
        record.state = PieceState::Verifying;
        let digest = Sha1Digest::of(record.assembled());

        if digest == record.expected_digest() {
            let piece_len = record.length() as u64;
            let data = Bytes::from(record.take_buffer());
            self.storage.write_piece(index as u32, data).await?;
            let record = &mut self.records[index];
            record.state = PieceState::Complete;
            self.have.set(index);
            self.pieces_complete += 1;
            self.bytes_verified += piece_len;
            info!("Piece {} verified ({}/{})", index, self.pieces_complete, self.records.len());
            Ok(BlockOutcome::Verified { piece: index as u32 })
        } else {
            warn!(
                "Piece {} failed verification: expected {}, computed {}",
                index,
                record.expected_digest(),
                digest
            );
            self.hash_failures += 1;
            self.blocks_unreceived += record.block_count();
            record.reset();
            Ok(BlockOutcome::HashMismatch { piece: index as u32 })
        }
    }

    /// Release a timed-out request so another peer can claim the block
    pub fn on_request_timeout(&mut self, peer: SocketAddr, request: BlockRequest) {
        let index = request.piece as usize;
        if index >= self.records.len() {
            return;
        }
        debug!("Request timeout: piece {} offset {} from {}", request.piece, request.offset, peer);
        let block_index = (request.offset / BLOCK_LENGTH) as usize;
        if block_index < self.records[index].block_count() {
            self.records[index].release_block(block_index, peer);
        }
    }

    /// Account for a peer's full bitfield (called once per session)
    pub fn peer_bitfield(&mut self, remote: &Bitfield) {
        for index in 0..self.availability.len() {
            if remote.has(index) {
                self.availability[index] += 1;
            }
        }
    }

    /// Account for a peer's `have` announcement
    pub fn peer_has(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// Remove a disconnected peer: availability drops for every piece it
    /// advertised and all of its outstanding claims are released
    pub fn peer_disconnected(&mut self, peer: SocketAddr, remote: &Bitfield) {
        for index in 0..self.availability.len() {
            if remote.has(index) {
                self.availability[index] = self.availability[index].saturating_sub(1);
            }
        }
        for record in &mut self.records {
            record.release_peer(peer);
        }
    }

    /// Serve a block of a completed piece for upload.
    ///
    /// Returns `None` when the piece is not complete locally; rejects
    /// misshapen request geometry as a protocol violation.
    pub async fn read_block(&mut self, piece: u32, offset: u32, length: u32) -> Result<Option<Bytes>> {
        let index = piece as usize;
        if index >= self.records.len() {
            return Err(TorrentError::protocol_error_with_source(
                "Requested piece index out of range",
                format!("piece {}", piece),
            )
            .into());
        }
        let piece_len = self.metadata.piece_size(index) as u32;
        if length == 0 || length > MAX_SERVED_BLOCK || offset.saturating_add(length) > piece_len {
            return Err(TorrentError::protocol_error_with_source(
                "Requested block geometry invalid",
                format!("piece {}, offset {}, length {}", piece, offset, length),
            )
            .into());
        }
        if !self.have.has(index) {
            return Ok(None);
        }

        let data = self.storage.read_piece(piece).await?;
        self.bytes_uploaded += length as u64;
        Ok(Some(data.slice(offset as usize..(offset + length) as usize)))
    }

    /// Flush storage to durable media
    pub async fn flush(&mut self) -> Result<()> {
        self.storage.flush().await
    }

    /// True once every piece is Complete
    pub fn is_complete(&self) -> bool {
        self.pieces_complete == self.records.len()
    }

    /// Snapshot of the local have-set
    pub fn bitfield(&self) -> Bitfield {
        self.have.clone()
    }

    /// Number of verified pieces
    pub fn pieces_complete(&self) -> usize {
        self.pieces_complete
    }

    /// Total pieces in the torrent
    pub fn piece_count(&self) -> usize {
        self.records.len()
    }

    /// Bytes of verified payload received
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Bytes served to peers
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Pieces that failed digest verification
    pub fn hash_failures(&self) -> u64 {
        self.hash_failures
    }

    /// Bytes still needed to finish the download
    pub fn bytes_left(&self) -> u64 {
        self.metadata.total_length.saturating_sub(self.bytes_verified)
    }
}

/// Upper bound on a served block; larger requests are protocol abuse
const MAX_SERVED_BLOCK: u32 = 128 * 1024;
