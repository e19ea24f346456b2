//! Peer wire protocol
//!
//! The fixed-format handshake, the length-prefixed message set, and the
//! framing layer that extracts whole messages from a partially-filled
//! inbound buffer.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::next_frame;
