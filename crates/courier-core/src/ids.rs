//! Bundle identifiers.
//!
//! A `BundleId` is a 16-byte value, globally unique across nodes, treated as
//! an opaque key everywhere it is stored or compared — hashed for lookup and
//! ordered lexicographically for the store's primary key (Design Notes,
//! `spec.md` §9).

use std::fmt;

/// A 16-byte bundle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleId([u8; 16]);

impl BundleId {
    /// Generate a fresh random bundle id.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        BundleId(bytes)
    }

    /// Wrap raw bytes as a bundle id.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        BundleId(bytes)
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse from a hex string (32 hex chars, no separators).
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let arr: [u8; 16] = decoded.try_into().ok()?;
        Some(BundleId(arr))
    }

    /// Render as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A node/peer address, `host:port` as supplied on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(pub String);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
