//! Wire framing
//!
//! Extracts length-prefixed frames from a session's inbound buffer.
//! Bytes accumulate across partial reads until a complete frame is
//! present; oversized length prefixes are treated as protocol
//! violations before any allocation happens.

use anyhow::Result;
use bytes::Bytes;

use crate::error::TorrentError;
use crate::net::ByteBuffer;

/// Largest acceptable frame: a piece message carrying a generously
/// sized block, or a bitfield for a very large torrent
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Pop one complete frame (the bytes after the length prefix) from the
/// buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame;
/// the caller reads more from the socket and retries. A zero-length
/// frame (keep-alive) yields `Some` with empty bytes.
pub fn next_frame(buffer: &mut ByteBuffer) -> Result<Option<Bytes>> {
    let prefix = buffer.peek(4);
    if prefix.len() < 4 {
        return Ok(None);
    }
    let frame_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    if frame_len > MAX_FRAME_LEN {
        return Err(TorrentError::protocol_error_with_source(
            "Frame length exceeds limit",
            format!("{} bytes (limit {})", frame_len, MAX_FRAME_LEN),
        )
        .into());
    }

    if buffer.remaining() < 4 + frame_len {
        return Ok(None);
    }

    buffer.consume(4);
    let frame = Bytes::copy_from_slice(buffer.peek(frame_len));
    buffer.consume(frame_len);
    buffer.compact();
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    #[test]
    fn test_incomplete_prefix_yields_none() {
        let mut buffer = ByteBuffer::new();
        buffer.write(&[0, 0, 0]);
        assert_eq!(next_frame(&mut buffer).unwrap(), None);
        // the partial prefix stays buffered
        assert_eq!(buffer.remaining(), 3);
    }

    #[test]
    fn test_incomplete_frame_yields_none() {
        let mut buffer = ByteBuffer::new();
        buffer.write(&[0, 0, 0, 5, 4, 0, 0]);
        assert_eq!(next_frame(&mut buffer).unwrap(), None);
        assert_eq!(buffer.remaining(), 7);
    }

    #[test]
    fn test_keepalive_frame() {
        let mut buffer = ByteBuffer::new();
        buffer.write(&[0, 0, 0, 0]);
        let frame = next_frame(&mut buffer).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_assembled_across_partial_writes() {
        let mut buffer = ByteBuffer::new();
        let encoded = Message::Have { piece: 7 }.encode();

        buffer.write(&encoded[..3]);
        assert_eq!(next_frame(&mut buffer).unwrap(), None);
        buffer.write(&encoded[3..6]);
        assert_eq!(next_frame(&mut buffer).unwrap(), None);
        buffer.write(&encoded[6..]);

        let frame = next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(Message::decode(frame).unwrap(), Message::Have { piece: 7 });
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buffer = ByteBuffer::new();
        buffer.write(&Message::Unchoke.encode());
        buffer.write(&Message::Have { piece: 3 }.encode());

        let first = next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(Message::decode(first).unwrap(), Message::Unchoke);
        let second = next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(Message::decode(second).unwrap(), Message::Have { piece: 3 });
        assert_eq!(next_frame(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_is_protocol_error() {
        let mut buffer = ByteBuffer::new();
        buffer.write(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        assert!(next_frame(&mut buffer).is_err());
    }
}
