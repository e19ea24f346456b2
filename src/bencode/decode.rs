//! Bencode decoder
//!
//! Recursive-descent decoder over the four bencoding productions. All
//! malformed input is rejected with a `ParseError`; the decoder never
//! panics on untrusted bytes.

use anyhow::Result;
use bytes::Bytes;
use tracing::trace;

use crate::bencode::value::{Dictionary, Value};
use crate::error::TorrentError;

/// Maximum container nesting before the decoder refuses the input
const MAX_DEPTH: usize = 64;

/// Decode a complete bencoded document.
///
/// Fails on truncated input, unknown leading bytes, malformed integer or
/// length tokens, unterminated containers, and trailing bytes after the
/// top-level value.
pub fn decode(data: &[u8]) -> Result<Value> {
    trace!("Decoding {} bytes of bencode", data.len());
    let mut pos = 0;
    let value = decode_value(data, &mut pos, 0)?;

    if pos != data.len() {
        return Err(TorrentError::parse_error_with_source(
            "Trailing data after bencoded value",
            format!("{} bytes consumed, {} available", pos, data.len()),
        )
        .into());
    }

    Ok(value)
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(TorrentError::parse_error("Bencode nesting too deep").into());
    }

    match data.get(*pos) {
        None => Err(TorrentError::parse_error("Unexpected end of input").into()),
        Some(b'i') => decode_integer(data, pos),
        Some(b'l') => decode_list(data, pos, depth),
        Some(b'd') => decode_dict(data, pos, depth),
        Some(b'0'..=b'9') => decode_bytes(data, pos).map(Value::Bytes),
        Some(&c) => Err(TorrentError::parse_error_with_source(
            "Unknown leading byte",
            format!("0x{:02x} at offset {}", c, pos),
        )
        .into()),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value> {
    *pos += 1; // skip 'i'

    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(TorrentError::parse_error("Unterminated integer").into());
    }

    let body = &data[start..*pos];
    let text = std::str::from_utf8(body)
        .map_err(|_| TorrentError::parse_error("Integer contains non-ASCII bytes"))?;

    if text.is_empty() {
        return Err(TorrentError::parse_error("Empty integer").into());
    }
    // "0" is the only value allowed a leading zero, and negative zero is
    // not a valid encoding
    if text.starts_with("-0") || (text.starts_with('0') && text.len() > 1) {
        return Err(TorrentError::parse_error_with_source("Invalid integer encoding", text.to_string()).into());
    }

    let value: i64 = text
        .parse()
        .map_err(|_| TorrentError::parse_error_with_source("Integer out of range", text.to_string()))?;

    *pos += 1; // skip 'e'
    Ok(Value::Integer(value))
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Bytes> {
    let start = *pos;
    while *pos < data.len() && data[*pos] != b':' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(TorrentError::parse_error("Unterminated string length").into());
    }

    let len_text = std::str::from_utf8(&data[start..*pos])
        .map_err(|_| TorrentError::parse_error("String length is not ASCII"))?;
    if !len_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TorrentError::parse_error_with_source("Invalid string length", len_text.to_string()).into());
    }
    let len: usize = len_text
        .parse()
        .map_err(|_| TorrentError::parse_error_with_source("String length out of range", len_text.to_string()))?;

    *pos += 1; // skip ':'

    if data.len() - *pos < len {
        return Err(TorrentError::parse_error_with_source(
            "String shorter than declared length",
            format!("declared {}, available {}", len, data.len() - *pos),
        )
        .into());
    }

    let bytes = Bytes::copy_from_slice(&data[*pos..*pos + len]);
    *pos += len;
    Ok(bytes)
}

fn decode_list(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    *pos += 1; // skip 'l'

    let mut items = Vec::new();
    loop {
        match data.get(*pos) {
            None => return Err(TorrentError::parse_error("Unterminated list").into()),
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::List(items));
            }
            Some(_) => items.push(decode_value(data, pos, depth + 1)?),
        }
    }
}

fn decode_dict(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    *pos += 1; // skip 'd'

    let mut dict = Dictionary::new();
    loop {
        match data.get(*pos) {
            None => return Err(TorrentError::parse_error("Unterminated dictionary").into()),
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::Dict(dict));
            }
            Some(b'0'..=b'9') => {
                let key = decode_bytes(data, pos)?;
                if dict.contains_key(&key) {
                    return Err(TorrentError::parse_error_with_source(
                        "Duplicate dictionary key",
                        String::from_utf8_lossy(&key).into_owned(),
                    )
                    .into());
                }
                if *pos >= data.len() || data[*pos] == b'e' {
                    return Err(TorrentError::parse_error("Dictionary key without value").into());
                }
                let value = decode_value(data, pos, depth + 1)?;
                dict.insert(key, value);
            }
            Some(_) => {
                return Err(TorrentError::parse_error("Dictionary key must be a byte string").into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    #[test]
    fn test_decode_integer() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"i-17e").unwrap(), Value::Integer(-17));
    }

    #[test]
    fn test_decode_rejects_malformed_integers() {
        assert!(decode(b"i42").is_err()); // unterminated
        assert!(decode(b"ie").is_err()); // empty
        assert!(decode(b"i-0e").is_err()); // negative zero
        assert!(decode(b"i03e").is_err()); // leading zero
        assert!(decode(b"i4x2e").is_err()); // non-digit body
    }

    #[test]
    fn test_decode_string() {
        assert_eq!(decode(b"4:spam").unwrap(), Value::string("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::string(""));
    }

    #[test]
    fn test_decode_rejects_short_string() {
        assert!(decode(b"5:abc").is_err());
        assert!(decode(b"5").is_err());
        assert!(decode(b"-1:x").is_err());
    }

    #[test]
    fn test_decode_list() {
        let value = decode(b"l4:spami42ee").unwrap();
        let items = value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_str(), Some("spam"));
        assert_eq!(items[1].as_integer(), Some(42));
    }

    #[test]
    fn test_decode_rejects_unterminated_containers() {
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d3:key3:val").is_err());
    }

    #[test]
    fn test_decode_dict() {
        let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get(b"cow").and_then(|v| v.as_str()), Some("moo"));
        assert_eq!(dict.get(b"spam").and_then(|v| v.as_str()), Some("eggs"));
    }

    #[test]
    fn test_decode_rejects_dict_key_without_value() {
        assert!(decode(b"d3:keye").is_err());
    }

    #[test]
    fn test_decode_rejects_non_string_dict_key() {
        assert!(decode(b"di1e3:vale").is_err());
    }

    #[test]
    fn test_decode_rejects_duplicate_dict_key() {
        assert!(decode(b"d1:ai1e1:ai2ee").is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_data() {
        assert!(decode(b"i1ei2e").is_err());
        assert!(decode(b"4:spamx").is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_leading_byte() {
        assert!(decode(b"x").is_err());
        assert!(decode(b"").is_err());
    }

    #[test]
    fn test_decode_preserves_dict_order() {
        // keys intentionally out of sorted order
        let value = decode(b"d5:zebra3:one5:apple3:twoe").unwrap();
        let dict = value.as_dict().unwrap();
        let keys: Vec<&[u8]> = dict.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![b"zebra".as_ref(), b"apple".as_ref()]);
    }

    #[test]
    fn test_decode_depth_limit() {
        let mut input = Vec::new();
        for _ in 0..80 {
            input.push(b'l');
        }
        input.push(b'e');
        assert!(decode(&input).is_err());
    }

    #[test]
    fn test_round_trip() {
        let samples: &[&[u8]] = &[
            b"i42e",
            b"4:spam",
            b"l4:spami42ee",
            b"d3:cow3:moo4:spam4:eggse",
            b"d5:zebra3:one5:apple3:twoe",
            b"d4:dictd3:keyl1:a1:beee",
        ];
        for sample in samples {
            let value = decode(sample).unwrap();
            assert_eq!(encode(&value).as_ref(), *sample);
        }
    }
}
