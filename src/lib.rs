//! swarmdl
//!
//! A BitTorrent download engine: bencoding codec, metainfo parsing,
//! HTTP tracker announces, concurrent peer-wire sessions, rarest-first
//! piece scheduling with endgame duplication, SHA-1 verification, and
//! on-disk storage.

pub mod bencode;
pub mod cli;
pub mod client;
pub mod digest;
pub mod error;
pub mod net;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use bencode::{Dictionary, Value};
pub use cli::{CliArgs, Config, ProgressDisplay};
pub use client::{ClientConfig, ConnectionManager, TorrentState, TorrentStatus};
pub use digest::Sha1Digest;
pub use peer::{PeerSession, SessionLimits};
pub use piece::{Bitfield, PieceManager};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{FileStorage, StorageBackend};
pub use torrent::{MetainfoBuilder, MetainfoParser, TorrentMetadata};
pub use tracker::{TrackerClient, TrackerUpdate};
