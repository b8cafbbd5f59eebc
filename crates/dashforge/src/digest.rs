// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Content digests for operations, snapshots, and cache keys.
//!
//! Everything the engine addresses by content - operations, filesystem
//! snapshots, cache keys, image configs - is identified by a SHA-256
//! [`Digest`]. Digests render as `sha256:<hex>` and are stable across
//! processes: two semantically equal inputs always produce the same digest.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Number of raw bytes in a SHA-256 digest.
pub const DIGEST_BYTES: usize = 32;

/// Field separator fed into [`DigestWriter`] between a field name and value.
const FIELD_SEPARATOR: u8 = 0x1f;

/// Record separator fed into [`DigestWriter`] after each field.
const RECORD_SEPARATOR: u8 = 0x1e;

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_BYTES]);

impl Digest {
    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_BYTES]) -> Self {
        Self(bytes)
    }

    /// Digest of a byte buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// The all-zero digest. Used as the parent of root snapshots.
    pub const fn zero() -> Self {
        Self([0u8; DIGEST_BYTES])
    }

    /// Combine several digests into one, order-sensitively.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Digest>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0);
        }
        Self(hasher.finalize().into())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        &self.0
    }

    /// Lowercase hex encoding without the algorithm prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a `sha256:<hex>` or bare hex string.
    pub fn parse(s: &str) -> Option<Self> {
        let hex_part = s.strip_prefix("sha256:").unwrap_or(s);
        let bytes = hex::decode(hex_part).ok()?;
        let array: [u8; DIGEST_BYTES] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Truncated rendering keeps log lines readable.
        write!(f, "Digest(sha256:{}…)", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).ok_or_else(|| serde::de::Error::custom("invalid digest"))
    }
}

/// Incremental digest builder for canonical field encodings.
///
/// Fields are framed with ASCII unit/record separators so that adjacent
/// fields can never collide (`("ab", "c")` vs `("a", "bc")` hash differently).
#[derive(Default)]
pub struct DigestWriter {
    hasher: Sha256,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a named string field.
    pub fn field(&mut self, name: &str, value: &str) -> &mut Self {
        self.hasher.update(name.as_bytes());
        self.hasher.update([FIELD_SEPARATOR]);
        self.hasher.update(value.as_bytes());
        self.hasher.update([RECORD_SEPARATOR]);
        self
    }

    /// Feed a named optional field; `None` is encoded distinctly from `Some("")`.
    pub fn optional_field(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.field(name, v),
            None => self.field(name, "\u{0}none"),
        }
    }

    /// Feed a named list field, order-sensitively.
    pub fn list_field<S: AsRef<str>>(&mut self, name: &str, values: &[S]) -> &mut Self {
        self.hasher.update(name.as_bytes());
        self.hasher.update([FIELD_SEPARATOR]);
        for value in values {
            self.hasher.update(value.as_ref().as_bytes());
            self.hasher.update([FIELD_SEPARATOR]);
        }
        self.hasher.update([RECORD_SEPARATOR]);
        self
    }

    /// Feed raw bytes.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self.hasher.update([RECORD_SEPARATOR]);
        self
    }

    /// Feed another digest.
    pub fn digest(&mut self, digest: &Digest) -> &mut Self {
        self.hasher.update(digest.as_bytes());
        self.hasher.update([RECORD_SEPARATOR]);
        self
    }

    pub fn finish(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}
