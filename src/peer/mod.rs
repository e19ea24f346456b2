//! Peer sessions
//!
//! Per-connection wire-protocol state machines: handshake, bitfield
//! exchange, choke and interest flags, and the bounded block-request
//! pipeline.

pub mod session;
pub mod state;

pub use session::{run_inbound, run_outbound, PeerSession, SessionContext, SessionEvent, SessionLimits};
pub use state::{SessionFlags, SessionState};
