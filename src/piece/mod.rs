//! Piece state and scheduling
//!
//! Tracks per-piece and per-block download state, selects the next block
//! to request (rarest-first with endgame duplication), and verifies
//! completed pieces before they reach storage.

pub mod bitfield;
pub mod record;
pub mod manager;

pub use bitfield::Bitfield;
pub use manager::{BlockOutcome, PieceManager};
pub use record::{BlockRequest, BlockState, PieceRecord, PieceState, BLOCK_LENGTH};
