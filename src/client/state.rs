//! Aggregated torrent state
//!
//! The read-only snapshot consumed by external observers (CLI progress,
//! a GUI, an RPC surface). The engine mutates a shared copy behind a
//! lock and hands out clones, so readers never see a partial update.

use serde::Serialize;

/// Lifecycle of a managed torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TorrentStatus {
    /// Storage allocation and task startup in progress
    Starting,
    /// Trading pieces with the swarm
    Downloading,
    /// All pieces verified; serving uploads only
    Seeding,
    /// Stopped by request
    Stopped,
    /// Storage failed; the torrent cannot proceed
    Failed { reason: String },
}

impl TorrentStatus {
    /// Whether the torrent has reached a state it will not leave
    pub fn is_terminal(&self) -> bool {
        matches!(self, TorrentStatus::Stopped | TorrentStatus::Failed { .. })
    }
}

/// Aggregate counters for one torrent
#[derive(Debug, Clone, Serialize)]
pub struct TorrentState {
    pub status: TorrentStatus,
    pub name: String,
    pub pieces_complete: usize,
    pub pieces_total: usize,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
    pub connected_peers: usize,
    /// Seeder count from the most recent announce
    pub seeders: Option<u32>,
    /// Leecher count from the most recent announce
    pub leechers: Option<u32>,
    pub hash_failures: u64,
}

impl TorrentState {
    /// Initial state for a torrent that has not started yet
    pub fn new(name: String, pieces_total: usize, bytes_total: u64) -> Self {
        Self {
            status: TorrentStatus::Starting,
            name,
            pieces_complete: 0,
            pieces_total,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            bytes_total,
            connected_peers: 0,
            seeders: None,
            leechers: None,
            hash_failures: 0,
        }
    }

    /// Completed fraction in `[0, 1]`
    pub fn progress(&self) -> f64 {
        if self.pieces_total == 0 {
            1.0
        } else {
            self.pieces_complete as f64 / self.pieces_total as f64
        }
    }

    /// Whether every piece is verified
    pub fn is_complete(&self) -> bool {
        self.pieces_complete == self.pieces_total
    }
}
