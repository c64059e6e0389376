//! Digest helpers.
//!
//! Proofs of funding are deduplicated by a stable fingerprint of their
//! contents; this module pins down which hash that is (SHA-256) and how it
//! is written as text (unpadded base64url).

use base64ct::{Base64UrlUnpadded, Encoding as _};
use sha2::{Digest as _, Sha256};

/// A stable fingerprint of a byte string.
///
/// Two values are "the same" for deduplication purposes iff their digests
/// are equal.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the digest of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(bytes);
        Digest(h.finalize().into())
    }

    /// Return this digest as unpadded base64url text.
    pub fn to_text(&self) -> String {
        Base64UrlUnpadded::encode_string(&self.0)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn stable() {
        let a = Digest::of(b"hello world");
        let b = Digest::of(b"hello world");
        let c = Digest::of(b"hello worlb");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_text().len(), 43); // 32 bytes, unpadded base64
    }
}
