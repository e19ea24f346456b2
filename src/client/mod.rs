//! Torrent engine
//!
//! The connection manager that owns tracker, listener, and peer-session
//! tasks, and the aggregated torrent state it publishes for external
//! observers.

pub mod manager;
pub mod state;

pub use manager::{ClientConfig, ConnectionManager};
pub use state::{TorrentState, TorrentStatus};
