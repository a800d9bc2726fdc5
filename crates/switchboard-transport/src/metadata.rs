//! Call metadata: an ordered multi-map of ASCII keys to byte values.
//!
//! The framework reserves no keys. Keys are normalised to lowercase on
//! append, mirroring what HTTP/2-style transports do on the wire.

use bytes::Bytes;

use crate::error::{Result, TransportError};

/// Ordered multi-map of lowercase ASCII keys to byte values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Bytes)>,
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b',' && b != b';')
}

impl Metadata {
    /// Creates an empty metadata map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a key/value pair. The key is lowercased; duplicate keys are
    /// allowed and preserved in insertion order.
    pub fn append(&mut self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        if !valid_key(key) {
            return Err(TransportError::InvalidMetadataKey {
                key: key.to_string(),
            });
        }
        self.entries.push((key.to_ascii_lowercase(), value.into()));
        Ok(())
    }

    /// Appends a UTF-8 string value.
    pub fn append_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.append(key, Bytes::copy_from_slice(value.as_bytes()))
    }

    /// First value for the key, if any.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        let key = key.to_ascii_lowercase();
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// First value for the key as UTF-8, if present and valid.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All values recorded for the key, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a Bytes> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Iterates over all pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no pairs are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
