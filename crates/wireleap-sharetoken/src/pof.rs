//! Proofs of funding.

use serde::{Deserialize, Serialize};
use wireleap_crypto::d::Digest;

/// A proof of funding: a bearer credential issued by a service contract,
/// exchangeable for one servicekey activation.
///
/// The client treats the fields as opaque except for the expiration time;
/// the signature is checked by the contract, not by us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pof {
    /// Type tag assigned by the contract (for example `"sk"`).
    #[serde(rename = "type")]
    pub pof_type: String,
    /// Expiration as seconds since the Unix epoch.  The pof is usable
    /// strictly before this time.
    pub expiration: i64,
    /// Contract-chosen nonce making this pof unique.
    pub nonce: String,
    /// Contract signature over the above.
    pub signature: String,
}

impl Pof {
    /// Return true if this pof is no longer usable at time `now`
    /// (seconds since the Unix epoch).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiration <= now
    }

    /// Return a stable fingerprint of this pof.
    ///
    /// Two pofs are the same credential iff their digests are equal; the
    /// digest is also what we log instead of the raw material.
    pub fn digest(&self) -> Digest {
        // Serializing a struct cannot fail, and field order is fixed by
        // the declaration, so this is canonical.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Digest::of(&bytes)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// A pof for tests.
    pub(crate) fn pof(nonce: &str, expiration: i64) -> Pof {
        Pof {
            pof_type: "sk".into(),
            expiration,
            nonce: nonce.into(),
            signature: "sig".into(),
        }
    }

    #[test]
    fn expiry_boundary() {
        let p = pof("n1", 1000);
        assert!(!p.is_expired_at(999));
        assert!(p.is_expired_at(1000));
        assert!(p.is_expired_at(1001));
    }

    #[test]
    fn digest_distinguishes() {
        let a = pof("n1", 1000);
        let b = pof("n1", 1000);
        let c = pof("n2", 1000);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }
}
