//! Re-exported Ed25519 implementation, and the `Pubkey` identity type.
//!
//! Relays, contracts and servicekeys are all identified by Ed25519 public
//! keys.  On the wire and in persistent files these are written as unpadded
//! base64url text, so we wrap the raw key bytes in [`Pubkey`], which knows
//! that encoding and can be used as a map key without first validating the
//! curve point.

use base64ct::{Base64UrlUnpadded, Encoding as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use crate::KeyDecodeError;

// NOTE: We re-export the dalek types under the names the rest of the
// workspace uses for them.
pub use ed25519_dalek::{
    Signature, Signer, SigningKey as Keypair, Verifier, VerifyingKey as PublicKey,
};

/// The length of an Ed25519 public key, in bytes.
pub const ED25519_LEN: usize = 32;

/// An unvalidated Ed25519 public key, as used to identify relays and
/// contracts.
///
/// Unlike [`PublicKey`], this type does not check that the bytes form a
/// valid curve point until the key is actually used for verification.  That
/// lets us parse directories containing unusable keys, and compare and hash
/// identities cheaply.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pubkey([u8; ED25519_LEN]);

impl Pubkey {
    /// Construct a `Pubkey` from a slice of bytes.
    ///
    /// Returns an error if the slice is not 32 bytes long.
    pub fn from_bytes(b: &[u8]) -> Result<Self, KeyDecodeError> {
        let arr: [u8; ED25519_LEN] = b.try_into().map_err(|_| KeyDecodeError::BadLength {
            expected: ED25519_LEN,
            got: b.len(),
        })?;
        Ok(Pubkey(arr))
    }

    /// Return the bytes of this key.
    pub fn as_bytes(&self) -> &[u8; ED25519_LEN] {
        &self.0
    }

    /// Try to convert this identity into a validated [`PublicKey`] usable
    /// for signature verification.
    pub fn as_public_key(&self) -> Result<PublicKey, KeyDecodeError> {
        PublicKey::from_bytes(&self.0).map_err(|_| KeyDecodeError::BadKey)
    }
}

impl From<PublicKey> for Pubkey {
    fn from(pk: PublicKey) -> Self {
        Pubkey(pk.to_bytes())
    }
}

impl From<&PublicKey> for Pubkey {
    fn from(pk: &PublicKey) -> Self {
        Pubkey(pk.to_bytes())
    }
}

impl Display for Pubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Base64UrlUnpadded::encode_string(&self.0))
    }
}

impl Debug for Pubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self)
    }
}

impl FromStr for Pubkey {
    type Err = KeyDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| KeyDecodeError::BadBase64)?;
        Pubkey::from_bytes(&bytes)
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generate a new random Ed25519 keypair from the operating system RNG.
pub fn gen_keypair() -> Keypair {
    use rand::rngs::OsRng;
    Keypair::generate(&mut OsRng)
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    use super::*;

    #[test]
    fn identity_round_trip() {
        let kp = gen_keypair();
        let id: Pubkey = kp.verifying_key().into();
        let text = id.to_string();
        let id2: Pubkey = text.parse().unwrap();
        assert_eq!(id, id2);
        assert_eq!(id2.as_public_key().unwrap(), kp.verifying_key());
    }

    #[test]
    fn bad_identities() {
        assert_eq!(
            "!!!!".parse::<Pubkey>().unwrap_err(),
            KeyDecodeError::BadBase64
        );
        assert_eq!(
            "aGVsbG8".parse::<Pubkey>().unwrap_err(),
            KeyDecodeError::BadLength {
                expected: 32,
                got: 5
            }
        );
    }

    #[test]
    fn serde_as_string() {
        let kp = gen_keypair();
        let id: Pubkey = kp.verifying_key().into();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let id2: Pubkey = serde_json::from_str(&json).unwrap();
        assert_eq!(id, id2);
    }
}
