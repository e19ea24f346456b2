//! Bencode encoder
//!
//! Structural inverse of the decoder. Dictionaries are written in their
//! stored entry order, which reproduces the original byte sequence for
//! trees produced by the decoder.

use bytes::{BufMut, Bytes, BytesMut};

use crate::bencode::value::Value;

/// Encode a value into a fresh byte buffer
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.freeze()
}

/// Encode a value into a caller-supplied buffer
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(bytes) => {
            buf.put_slice(bytes.len().to_string().as_bytes());
            buf.put_u8(b':');
            buf.put_slice(bytes);
        }
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            for (key, val) in dict.iter() {
                buf.put_slice(key.len().to_string().as_bytes());
                buf.put_u8(b':');
                buf.put_slice(key);
                encode_into(val, buf);
            }
            buf.put_u8(b'e');
        }
    }
}
