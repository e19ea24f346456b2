//! Peer wire messages
//!
//! The length-prefixed message set exchanged after the handshake.
//! A zero-length frame is a keep-alive; every other frame carries a
//! one-byte id (0 through 8) and a type-specific payload.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TorrentError;

/// Wire message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(TorrentError::protocol_error_with_source("Unknown message id", format!("value: {}", value)).into()),
        }
    }
}

/// A peer wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield { bits: Bytes },
    Request { piece: u32, offset: u32, length: u32 },
    Piece { piece: u32, offset: u32, block: Bytes },
    Cancel { piece: u32, offset: u32, length: u32 },
}

impl Message {
    /// The message id, or `None` for keep-alive
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    /// Frame length on the wire, excluding the 4-byte prefix
    pub fn frame_len(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bits } => 1 + bits.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
        }
    }

    /// Serialize the message including its length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.frame_len() as usize);
        buf.put_u32(self.frame_len());

        if let Some(id) = self.id() {
            buf.put_u8(id as u8);
        }
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece } => {
                buf.put_u32(*piece);
            }
            Message::Bitfield { bits } => {
                buf.put_slice(bits);
            }
            Message::Request { piece, offset, length } | Message::Cancel { piece, offset, length } => {
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Piece { piece, offset, block } => {
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_slice(block);
            }
        }
        buf.freeze()
    }

    /// Parse a message from one frame (the bytes after the length
    /// prefix). An empty frame is a keep-alive; a malformed frame is a
    /// protocol violation.
    pub fn decode(frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let mut buf = frame;
        let id = MessageId::try_from(buf.get_u8())?;

        match id {
            MessageId::Choke => expect_empty(buf, Message::Choke),
            MessageId::Unchoke => expect_empty(buf, Message::Unchoke),
            MessageId::Interested => expect_empty(buf, Message::Interested),
            MessageId::NotInterested => expect_empty(buf, Message::NotInterested),
            MessageId::Have => {
                if buf.remaining() != 4 {
                    return Err(payload_error(id, buf.remaining()));
                }
                Ok(Message::Have { piece: buf.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield { bits: buf }),
            MessageId::Request | MessageId::Cancel => {
                if buf.remaining() != 12 {
                    return Err(payload_error(id, buf.remaining()));
                }
                let piece = buf.get_u32();
                let offset = buf.get_u32();
                let length = buf.get_u32();
                if id == MessageId::Request {
                    Ok(Message::Request { piece, offset, length })
                } else {
                    Ok(Message::Cancel { piece, offset, length })
                }
            }
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(payload_error(id, buf.remaining()));
                }
                let piece = buf.get_u32();
                let offset = buf.get_u32();
                Ok(Message::Piece { piece, offset, block: buf })
            }
        }
    }
}

fn expect_empty(buf: Bytes, message: Message) -> Result<Message> {
    if buf.has_remaining() {
        return Err(payload_error(message.id().expect("flag messages have ids"), buf.remaining()));
    }
    Ok(message)
}

fn payload_error(id: MessageId, remaining: usize) -> anyhow::Error {
    TorrentError::protocol_error_with_source(
        "Malformed message payload",
        format!("{:?} with {} payload bytes", id, remaining),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let encoded = message.encode();
        // strip the length prefix the framing layer would consume
        let frame = encoded.slice(4..);
        Message::decode(frame).unwrap()
    }

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn test_flag_messages_round_trip() {
        for message in [Message::Choke, Message::Unchoke, Message::Interested, Message::NotInterested] {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn test_have_round_trip() {
        assert_eq!(round_trip(Message::Have { piece: 42 }), Message::Have { piece: 42 });
    }

    #[test]
    fn test_bitfield_round_trip() {
        let message = Message::Bitfield {
            bits: Bytes::from_static(&[0b1010_0000, 0b0100_0000]),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_request_wire_layout() {
        let encoded = Message::Request { piece: 1, offset: 2, length: 3 }.encode();
        assert_eq!(
            encoded.as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn test_piece_round_trip() {
        let message = Message::Piece {
            piece: 10,
            offset: 16384,
            block: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        assert_eq!(round_trip(message.clone()), message);
        assert_eq!(message.frame_len(), 14);
    }

    #[test]
    fn test_cancel_round_trip() {
        let message = Message::Cancel { piece: 1, offset: 2, length: 3 };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        assert!(Message::decode(Bytes::from_static(&[9])).is_err());
        assert!(Message::decode(Bytes::from_static(&[200])).is_err());
    }

    #[test]
    fn test_short_payloads_are_rejected() {
        // have with 2 payload bytes
        assert!(Message::decode(Bytes::from_static(&[4, 0, 0])).is_err());
        // request with 11 payload bytes
        assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])).is_err());
        // piece with 7 payload bytes
        assert!(Message::decode(Bytes::from_static(&[7, 0, 0, 0, 0, 0, 0, 0])).is_err());
    }

    #[test]
    fn test_flag_message_with_payload_is_rejected() {
        assert!(Message::decode(Bytes::from_static(&[0, 1])).is_err());
    }

    #[test]
    fn test_empty_piece_block_is_allowed() {
        let message = Message::Piece {
            piece: 0,
            offset: 0,
            block: Bytes::new(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }
}
