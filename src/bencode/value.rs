//! Bencode value tree
//!
//! Defines the tagged union produced by the decoder and consumed by the
//! encoder. Values are immutable once decoded.

use bytes::Bytes;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer
    Integer(i64),
    /// A byte string (not necessarily valid UTF-8)
    Bytes(Bytes),
    /// An ordered list of values
    List(Vec<Value>),
    /// A dictionary with byte-string keys, kept in decode order
    Dict(Dictionary),
}

impl Value {
    /// Create a byte-string value from a UTF-8 string
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Return the value as an integer, if it is one
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Return the value as a byte string, if it is one
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Return the value as a UTF-8 string, if it is a valid one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Return the value as a list, if it is one
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Return the value as a dictionary, if it is one
    pub fn as_dict(&self) -> Option<&Dictionary> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<Dictionary> for Value {
    fn from(d: Dictionary) -> Self {
        Value::Dict(d)
    }
}

/// A bencode dictionary that preserves insertion order.
///
/// Bencoding requires keys to be sorted on the wire, but torrents in the
/// wild are identified by the digest of the info dictionary exactly as it
/// appeared in the file. Keeping decode order lets the encoder reproduce
/// that byte sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: Vec<(Bytes, Value)>,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Insert a key/value pair, replacing any existing value for the key
    pub fn insert(&mut self, key: impl Into<Bytes>, value: Value) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Look up a value by key
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k.as_ref() == key).map(|(_, v)| v)
    }

    /// Whether the dictionary contains the key
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
