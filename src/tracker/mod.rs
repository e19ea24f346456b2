//! Tracker communication
//!
//! Periodic HTTP announces that report transfer totals and yield
//! candidate peer addresses.

pub mod client;
pub mod response;

pub use client::{run_announce_loop, TrackerClient, TrackerUpdate, TransferTotals};
pub use response::{AnnounceEvent, AnnounceResponse};
