use crate::config::types::{GradeError, Result};
use crate::corpus::BUFFER_LEN;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Immutable fixed-length byte buffer. Identity is content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer([u8; BUFFER_LEN]);

impl Buffer {
    pub fn new(bytes: [u8; BUFFER_LEN]) -> Self {
        Self(bytes)
    }

    /// Any slice whose length is not exactly `BUFFER_LEN` is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; BUFFER_LEN] = bytes.try_into().map_err(|_| {
            GradeError::Corpus(format!(
                "buffer must be exactly {} bytes, got {}",
                BUFFER_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text)
            .map_err(|e| GradeError::Protocol(format!("invalid hex buffer: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn filled(byte: u8) -> Self {
        Self([byte; BUFFER_LEN])
    }

    /// Build a buffer from a per-position generator.
    pub fn from_fn(f: impl FnMut(usize) -> u8) -> Self {
        Self(std::array::from_fn(f))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Apply a bytewise map.
    pub fn map(&self, f: impl Fn(u8) -> u8) -> Self {
        Self(self.0.map(f))
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Buffer {
    type Error = GradeError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::from_slice(bytes)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({})", self.to_hex())
    }
}

impl Serialize for Buffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Buffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Buffer::from_hex(&text).map_err(serde::de::Error::custom)
    }
}
